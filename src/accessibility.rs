use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::adb::{self, DeviceExecutor};
use crate::cache::now_ms;
use crate::config::{AccessibilitySettings, ObserverConfig};
use crate::error::AppError;
use crate::hierarchy::{filter, parse, score};
use crate::models::HierarchyResult;

/// Alternate hierarchy channel backed by an on-device accessibility service.
///
/// The service listens for a broadcast carrying a request token, writes a
/// JSON dump named after that token, and this side polls for the file. The
/// channel is opt-in: most devices go through `uiautomator dump` instead.
pub struct AccessibilityChannel {
    executor: Arc<dyn DeviceExecutor>,
    settings: AccessibilitySettings,
    timeout: Duration,
}

impl AccessibilityChannel {
    pub fn new(executor: Arc<dyn DeviceExecutor>, config: &ObserverConfig) -> Self {
        Self {
            executor,
            settings: config.accessibility.clone(),
            timeout: Duration::from_secs(config.command.shell_timeout_secs),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub async fn fetch(&self, serial: &str, trace_id: &str) -> Result<HierarchyResult, AppError> {
        let token = Uuid::new_v4().to_string();
        let output_path = format!("{}/a11y_{token}.json", self.settings.output_dir);
        let started_at_ms = now_ms();

        let broadcast = format!(
            "am broadcast -a {} --es token {token}",
            self.settings.broadcast_action
        );
        adb::shell(self.executor.as_ref(), serial, &broadcast, self.timeout, trace_id).await?;

        let payload = self
            .poll_for_dump(serial, &output_path, started_at_ms, trace_id)
            .await?;

        let value: serde_json::Value = serde_json::from_str(&payload).map_err(|err| {
            AppError::dependency(
                format!("accessibility dump is not valid JSON: {err}"),
                trace_id,
            )
        })?;
        let raw = parse::parse_json_node(&value)
            .map_err(|err| AppError::dependency(err, trace_id))?;

        let mut root = filter::filter_tree(&raw);
        if let Some(node) = root.as_mut() {
            score::annotate_scores(node);
        }
        Ok(HierarchyResult { root, error: None })
    }

    /// Polls until the service has written a file younger than the broadcast.
    /// A stale leftover from an earlier request never satisfies the wait.
    async fn poll_for_dump(
        &self,
        serial: &str,
        output_path: &str,
        started_at_ms: i64,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let deadline = started_at_ms + self.settings.poll_timeout_ms as i64;
        let interval = Duration::from_millis(self.settings.poll_interval_ms);

        loop {
            if let Some(mtime_ms) = self.file_mtime_ms(serial, output_path, trace_id).await {
                // Seconds-granularity mtime; round the start down to match.
                if mtime_ms >= (started_at_ms / 1000) * 1000 {
                    let cat = format!("cat {output_path}");
                    let output =
                        adb::shell(self.executor.as_ref(), serial, &cat, self.timeout, trace_id)
                            .await?;
                    let cleanup = format!("rm -f {output_path}");
                    let _ = adb::shell(
                        self.executor.as_ref(),
                        serial,
                        &cleanup,
                        self.timeout,
                        trace_id,
                    )
                    .await;
                    return Ok(output.stdout);
                }
            }

            if now_ms() >= deadline {
                return Err(AppError::dependency(
                    "accessibility service did not produce a dump in time",
                    trace_id,
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn file_mtime_ms(&self, serial: &str, path: &str, trace_id: &str) -> Option<i64> {
        let command = format!("stat -c %Y {path}");
        let output = adb::shell(self.executor.as_ref(), serial, &command, self.timeout, trace_id)
            .await
            .ok()?;
        output
            .stdout
            .trim()
            .parse::<i64>()
            .ok()
            .map(|secs| secs * 1000)
    }
}
