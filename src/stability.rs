use std::sync::Arc;
use std::time::Duration;

use crate::adb::{self, DeviceExecutor};
use crate::config::StabilitySettings;
use crate::dumpsys::gfxinfo::parse_gfx_stats;
use crate::error::AppError;
use crate::models::{StabilitySample, StabilityState, StabilityVerdict};

/// Samples per-app rendering statistics and decides whether the app has
/// stopped animating.
pub struct StabilityDetector {
    executor: Arc<dyn DeviceExecutor>,
    settings: StabilitySettings,
    timeout: Duration,
}

impl StabilityDetector {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        settings: StabilitySettings,
        shell_timeout_secs: u64,
    ) -> Self {
        Self {
            executor,
            settings,
            timeout: Duration::from_secs(shell_timeout_secs),
        }
    }

    /// One poll. The returned state always carries the latest parsed
    /// counters so the next call's deltas are relative to the most recent
    /// sample, whatever the verdict was.
    pub async fn sample(
        &self,
        serial: &str,
        app_id: &str,
        previous: &StabilityState,
        trace_id: &str,
    ) -> (StabilityVerdict, StabilityState) {
        if is_system_package(app_id, &self.settings.system_packages) {
            tracing::debug!(app_id, "System package, skipping frame-stat sampling");
            return (StabilityVerdict::stable(), *previous);
        }

        let output = match adb::shell(
            self.executor.as_ref(),
            serial,
            &format!("dumpsys gfxinfo {app_id}"),
            self.timeout,
            trace_id,
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(app_id, error = %err, "gfxinfo probe failed");
                return (StabilityVerdict::insufficient_data(), *previous);
            }
        };

        // Packages without a render thread produce no stats at all; that is
        // not instability.
        if output.stdout.trim().is_empty() {
            return (StabilityVerdict::stable(), *previous);
        }

        let Some(sample) = parse_gfx_stats(&output.stdout).into_sample() else {
            return (StabilityVerdict::insufficient_data(), *previous);
        };

        let verdict = evaluate(&sample, previous, &self.settings);
        tracing::debug!(
            app_id,
            stable = verdict.stable,
            p50 = sample.p50_ms,
            p90 = sample.p90_ms,
            p95 = sample.p95_ms,
            p99 = ?sample.p99_ms,
            "Stability sample"
        );
        let state = StabilityState {
            last: Some(sample.counters),
        };
        (verdict, state)
    }

    /// Resets the per-app counters, waits the settle delay to accumulate
    /// fresh frames, then takes a single reading with no prior state.
    pub async fn measure_instant(
        &self,
        serial: &str,
        app_id: &str,
        trace_id: &str,
    ) -> Result<StabilityVerdict, AppError> {
        adb::shell(
            self.executor.as_ref(),
            serial,
            &format!("dumpsys gfxinfo {app_id} reset"),
            self.timeout,
            trace_id,
        )
        .await?;
        tokio::time::sleep(Duration::from_millis(self.settings.settle_delay_ms)).await;
        let (verdict, _) = self
            .sample(serial, app_id, &StabilityState::default(), trace_id)
            .await;
        Ok(verdict)
    }
}

/// Stable iff all three counter deltas are zero and the guarded percentiles
/// are each strictly under threshold. p99 is deliberately excluded.
pub fn evaluate(
    sample: &StabilitySample,
    previous: &StabilityState,
    settings: &StabilitySettings,
) -> StabilityVerdict {
    let deltas = match previous.last {
        Some(last) => (
            sample.counters.missed_vsync.saturating_sub(last.missed_vsync),
            sample
                .counters
                .slow_ui_thread
                .saturating_sub(last.slow_ui_thread),
            sample
                .counters
                .frame_deadline_missed
                .saturating_sub(last.frame_deadline_missed),
        ),
        None => (0, 0, 0),
    };

    let counters_quiet = deltas == (0, 0, 0);
    let latency_ok = sample.p50_ms.floor() < settings.p50_threshold_ms
        && sample.p90_ms.floor() < settings.p90_threshold_ms
        && sample.p95_ms.floor() < settings.p95_threshold_ms;

    if counters_quiet && latency_ok {
        StabilityVerdict::stable()
    } else {
        StabilityVerdict::unstable()
    }
}

/// Exact or substring match in either direction against the allow-list.
pub fn is_system_package(app_id: &str, system_packages: &[String]) -> bool {
    system_packages
        .iter()
        .any(|known| app_id == known || app_id.contains(known.as_str()) || known.contains(app_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchIdleStatus {
    pub is_idle: bool,
    pub should_continue: bool,
}

/// Pure time comparison for pollers tracking touch/input idleness; no
/// device access.
pub fn touch_idle_status(
    elapsed_since_start_ms: u64,
    idle_since_last_event_ms: u64,
    required_idle_ms: u64,
    hard_limit_ms: u64,
) -> TouchIdleStatus {
    let is_idle = idle_since_last_event_ms >= required_idle_ms;
    TouchIdleStatus {
        is_idle,
        should_continue: !is_idle && elapsed_since_start_ms < hard_limit_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPollStatus {
    pub reached: bool,
    pub should_continue: bool,
}

pub fn rotation_poll_status(
    current: Option<i32>,
    target: i32,
    elapsed_ms: u64,
    timeout_ms: u64,
) -> RotationPollStatus {
    let reached = current == Some(target);
    RotationPollStatus {
        reached,
        should_continue: !reached && elapsed_ms < timeout_ms,
    }
}
