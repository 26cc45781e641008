//! BDD step definitions for hot-swap deploys.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use hotswap::InstanceOutcome;
use hotswap::sim::{Fault, run_scenario};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::HotswapContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a deployed instance group \"{group}\" with {instances:usize} instances")]
fn deployed_group(mut hotswap_context: HotswapContext, group: String, instances: usize) -> HotswapContext {
    hotswap_context.options.group = group.trim().to_owned();
    hotswap_context.options.instances = instances;
    hotswap_context
}

#[given("each instance has a {size:u64} MB persistent disk")]
fn persistent_disk(mut hotswap_context: HotswapContext, size: u64) -> HotswapContext {
    hotswap_context.options.persistent_disk_mb = Some(size);
    hotswap_context
}

#[given("replacement agents reject disk mounts")]
fn agents_reject_mounts(mut hotswap_context: HotswapContext) -> HotswapContext {
    hotswap_context.options.fault = Some(Fault::RejectMount);
    hotswap_context
}

#[given("replacement jobs fail after start")]
fn jobs_fail(mut hotswap_context: HotswapContext) -> HotswapContext {
    hotswap_context.options.fault = Some(Fault::FailHealth);
    hotswap_context
}

#[given("the provider refuses to create vms")]
fn provider_refuses(mut hotswap_context: HotswapContext) -> HotswapContext {
    hotswap_context.options.fault = Some(Fault::CreateError);
    hotswap_context
}

#[given("the update allows {max:usize} instances in flight")]
fn max_in_flight(mut hotswap_context: HotswapContext, max: usize) -> HotswapContext {
    hotswap_context.update.max_in_flight = NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN);
    hotswap_context
}

fn redeploy(mut hotswap_context: HotswapContext, recreate: bool) -> Result<HotswapContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    hotswap_context.options.recreate = recreate;
    let outcome = runtime.block_on(run_scenario(
        &hotswap_context.options,
        &hotswap_context.update,
        hotswap_context.timings,
    ));
    hotswap_context.outcome = Some(outcome);
    Ok(hotswap_context)
}

#[when("the deployment is redeployed with recreate")]
fn redeploy_with_recreate(hotswap_context: HotswapContext) -> Result<HotswapContext, StepError> {
    redeploy(hotswap_context, true)
}

#[when("the deployment is redeployed without recreate")]
fn redeploy_without_recreate(hotswap_context: HotswapContext) -> Result<HotswapContext, StepError> {
    redeploy(hotswap_context, false)
}

#[then("every instance is updated")]
fn every_instance_updated(hotswap_context: &HotswapContext) -> Result<(), StepError> {
    let outcome = hotswap_context.outcome();
    if outcome.report.is_success()
        && outcome.report.instances.len() == hotswap_context.options.instances
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected success, got: {}", outcome.report)))
    }
}

#[then("no instance was updated")]
fn no_instance_updated(hotswap_context: &HotswapContext) -> Result<(), StepError> {
    let outcome = hotswap_context.outcome();
    if outcome.report.instances.is_empty() && outcome.task.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected an empty task, got: {:?}", outcome.task)))
    }
}

#[then("the task output lists \"{first}\" before \"{second}\"")]
fn task_output_order(hotswap_context: &HotswapContext, first: String, second: String) -> Result<(), StepError> {
    let task = &hotswap_context.outcome().task;
    let position = |prefix: &str| task.iter().position(|line| line.starts_with(prefix));
    match (position(&first), position(&second)) {
        (Some(earlier), Some(later)) if earlier < later => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected {first:?} before {second:?} in {task:#?}"
        ))),
    }
}

#[then("the new agent was asked to \"{method}\"")]
fn new_agent_asked(hotswap_context: &HotswapContext, method: String) -> Result<(), StepError> {
    let messages = hotswap_context.outcome().messages.messages();
    let old_agents: BTreeSet<_> = messages
        .iter()
        .filter(|message| message.envelope.method == "unmount_disk")
        .map(|message| message.agent_id.clone())
        .collect();
    let asked = messages.iter().any(|message| {
        message.envelope.method == method && !old_agents.contains(&message.agent_id)
    });
    if asked {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("no {method} sent to a new agent")))
    }
}

#[then("the update fails with \"{kind}\"")]
fn update_fails_with(hotswap_context: &HotswapContext, kind: String) -> Result<(), StepError> {
    let report = &hotswap_context.outcome().report;
    let failed_as_expected = report.instances.iter().any(|entry| {
        matches!(&entry.outcome, InstanceOutcome::Failed { kind: actual, .. } if actual.as_str() == kind)
    });
    if failed_as_expected && !report.is_success() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected a {kind} failure, got: {report}")))
    }
}

#[then("the instance listing shows {count:usize} vms")]
fn listing_rows(hotswap_context: &HotswapContext, count: usize) -> Result<(), StepError> {
    let vms = &hotswap_context.outcome().vms;
    if vms.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected {count} rows, got {vms:#?}")))
    }
}

#[then("no vm was orphaned")]
fn no_orphans(hotswap_context: &HotswapContext) -> Result<(), StepError> {
    let report = &hotswap_context.outcome().report;
    if report.orphaned_vms.is_empty() && report.unreconciled_disks.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected leftovers: {report}")))
    }
}

#[then("at most {count:usize} instances were updated at once")]
fn peak_in_flight(hotswap_context: &HotswapContext, count: usize) -> Result<(), StepError> {
    let peak = hotswap_context.outcome().report.peak_in_flight;
    if (1..=count).contains(&peak) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("peak in flight was {peak}, limit {count}")))
    }
}

#[then("at most {count:usize} vms were alive at once")]
fn peak_live_vms(hotswap_context: &HotswapContext, count: usize) -> Result<(), StepError> {
    let peak = hotswap_context.outcome().peak_live_vms;
    if peak <= count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{peak} vms were alive, limit {count}")))
    }
}
