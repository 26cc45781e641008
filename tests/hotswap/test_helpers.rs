//! Shared fixtures for hot-swap BDD scenarios.

use hotswap::sim::{ScenarioOptions, ScenarioOutcome};
use hotswap::test_support::{fast_timings, fast_update_config};
use hotswap::{Timings, UpdateConfig};
use rstest::fixture;

#[derive(Clone, Debug)]
pub struct HotswapContext {
    pub options: ScenarioOptions,
    pub update: UpdateConfig,
    pub timings: Timings,
    pub outcome: Option<ScenarioOutcome>,
}

impl HotswapContext {
    pub fn outcome(&self) -> &ScenarioOutcome {
        self.outcome
            .as_ref()
            .unwrap_or_else(|| panic!("test setup requires a redeploy step"))
    }
}

#[fixture]
pub fn hotswap_context() -> HotswapContext {
    HotswapContext {
        options: ScenarioOptions::default(),
        update: fast_update_config(1),
        timings: fast_timings(),
        outcome: None,
    }
}
