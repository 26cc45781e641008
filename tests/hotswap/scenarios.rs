//! BDD scenarios for hot-swap deploys.

use rstest_bdd_macros::scenario;

use super::test_helpers::{HotswapContext, hotswap_context};

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Recreate an instance by swapping in a new vm"
)]
fn scenario_swap_with_disk(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Keep the old vm when the new agent rejects the disk"
)]
fn scenario_rejected_mount(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Keep the old vm when the new jobs fail"
)]
fn scenario_failing_health(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Leave the instance alone when the provider refuses the new vm"
)]
fn scenario_create_error(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Bound concurrent swaps by max in flight"
)]
fn scenario_max_in_flight(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}

#[scenario(
    path = "tests/features/hotswap.feature",
    name = "Skip instances that do not need a new vm"
)]
fn scenario_no_recreate(hotswap_context: HotswapContext) {
    let _ = hotswap_context;
}
