//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use capturerun_core::{InstanceState, MetaStatus, TaskKind};

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_task_metrics(state, &mut output);
    collect_queue_metrics(state, &mut output);
    collect_workpool_metrics(state, &mut output);
    collect_service_metrics(state, &mut output);

    output
}

/// Collect task metrics by coarse status and kind.
fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let tasks = state.scheduler.get_all_tasks();

    let mut waiting = 0u64;
    let mut running = 0u64;
    let mut finished = 0u64;
    let mut conversions = 0u64;
    let mut manual = 0u64;
    let mut stalled = 0u64;

    for task in &tasks {
        match task.meta() {
            MetaStatus::Init | MetaStatus::Waiting => waiting += 1,
            MetaStatus::Running => running += 1,
            MetaStatus::Finished => finished += 1,
        }
        match task.kind {
            TaskKind::Conversion => conversions += 1,
            TaskKind::ManualModeBuild => manual += 1,
        }
        if task.stalled {
            stalled += 1;
        }
    }

    writeln!(
        output,
        "# HELP capturerun_tasks Number of retained tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_tasks gauge").ok();
    writeln!(output, "capturerun_tasks{{status=\"waiting\"}} {waiting}").ok();
    writeln!(output, "capturerun_tasks{{status=\"running\"}} {running}").ok();
    writeln!(output, "capturerun_tasks{{status=\"finished\"}} {finished}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_tasks_by_kind Number of retained tasks by kind"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_tasks_by_kind gauge").ok();
    writeln!(
        output,
        "capturerun_tasks_by_kind{{kind=\"{}\"}} {conversions}",
        TaskKind::Conversion
    )
    .ok();
    writeln!(
        output,
        "capturerun_tasks_by_kind{{kind=\"{}\"}} {manual}",
        TaskKind::ManualModeBuild
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_tasks_stalled Running conversions flagged as stalled"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_tasks_stalled gauge").ok();
    writeln!(output, "capturerun_tasks_stalled {stalled}").ok();
}

/// Collect the live queue limits.
fn collect_queue_metrics(state: &Arc<AppState>, output: &mut String) {
    let limits = state.scheduler.limits();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_queue_limit Effective scheduler limits"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_queue_limit gauge").ok();
    writeln!(
        output,
        "capturerun_queue_limit{{limit=\"max_running\"}} {}",
        limits.running()
    )
    .ok();
    writeln!(
        output,
        "capturerun_queue_limit{{limit=\"max_finished\"}} {}",
        limits.finished()
    )
    .ok();
}

/// Collect instance, lease, and waiter counts per workpool.
fn collect_workpool_metrics(state: &Arc<AppState>, output: &mut String) {
    let workpools = state.pool.workpools();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_workpool_instances Workpool instances by state"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_workpool_instances gauge").ok();
    for summary in &workpools {
        for (label, instance_state) in [
            ("provisioning", InstanceState::Provisioning),
            ("available", InstanceState::Available),
            ("leased", InstanceState::Leased),
            ("broken", InstanceState::Broken),
        ] {
            writeln!(
                output,
                "capturerun_workpool_instances{{workpool=\"{}\",state=\"{label}\"}} {}",
                summary.spec.id,
                summary.count(instance_state)
            )
            .ok();
        }
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_workpool_leases Outstanding leases per workpool"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_workpool_leases gauge").ok();
    for summary in &workpools {
        writeln!(
            output,
            "capturerun_workpool_leases{{workpool=\"{}\"}} {}",
            summary.spec.id, summary.leases
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_workpool_waiters Jobs waiting for an instance per workpool"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_workpool_waiters gauge").ok();
    for summary in &workpools {
        writeln!(
            output,
            "capturerun_workpool_waiters{{workpool=\"{}\"}} {}",
            summary.spec.id, summary.waiters
        )
        .ok();
    }
}

/// Collect ticket and event-stream gauges.
fn collect_service_metrics(state: &Arc<AppState>, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_manual_tickets Manual-mode tickets whose task is retained"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_manual_tickets gauge").ok();
    writeln!(
        output,
        "capturerun_manual_tickets {}",
        state.manual.ticket_count()
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP capturerun_event_subscribers Connected event stream subscribers"
    )
    .ok();
    writeln!(output, "# TYPE capturerun_event_subscribers gauge").ok();
    writeln!(
        output,
        "capturerun_event_subscribers {}",
        state.events.subscriber_count()
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use capturerun_core::{WorkpoolId, WorkpoolSpec};

    use crate::config::Config;
    use crate::stub::{StubCapturer, StubConverter, StubProvisioner};

    fn state() -> Arc<AppState> {
        AppState::new(
            Config::default(),
            Arc::new(StubProvisioner::new(Duration::from_millis(1))),
            Arc::new(StubCapturer::new(Duration::from_millis(1))),
            Arc::new(StubConverter::new(Duration::from_millis(1))),
        )
    }

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = state();
        let output = collect_metrics(&state);

        // Should contain task metrics
        assert!(output.contains("capturerun_tasks{status=\"waiting\"} 0"));
        assert!(output.contains("capturerun_tasks_by_kind{kind=\"CONVERSION\"} 0"));

        // Should contain queue limits
        assert!(output.contains("capturerun_queue_limit{limit=\"max_running\"} 4"));

        // Should contain service gauges
        assert!(output.contains("capturerun_manual_tickets 0"));
        assert!(output.contains("capturerun_event_subscribers 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_workpools() {
        let state = state();
        let id = WorkpoolId::new("win10");
        state
            .pool
            .create_workpool(WorkpoolSpec::new(id.clone(), 2))
            .unwrap();
        state.pool.add_instance(&id, "vm-a").unwrap();
        let _lease = state.pool.acquire(&id).await.unwrap();

        let output = collect_metrics(&state);
        assert!(output
            .contains("capturerun_workpool_instances{workpool=\"win10\",state=\"leased\"} 1"));
        assert!(output
            .contains("capturerun_workpool_instances{workpool=\"win10\",state=\"available\"} 0"));
        assert!(output.contains("capturerun_workpool_leases{workpool=\"win10\"} 1"));
        assert!(output.contains("capturerun_workpool_waiters{workpool=\"win10\"} 0"));
    }
}
