//! Behavioural scenarios for hot-swap deploys.

mod hotswap;
