use std::sync::Arc;
use std::time::Duration;

use crate::adb::{self, DeviceExecutor};
use crate::cache::{now_ms, CacheService, TtlCache};
use crate::config::ObserverConfig;
use crate::error::AppError;

/// The one expensive diagnostic-text command, shared by the geometry, inset
/// and rotation parsers to avoid duplicate device round-trips.
pub const RAW_DUMP_COMMAND: &str = "wm size; dumpsys window";

pub struct RawDumpCache {
    executor: Arc<dyn DeviceExecutor>,
    cache: Arc<CacheService>,
    memory: TtlCache<String, String>,
    ttl_ms: u64,
    timeout: Duration,
}

impl RawDumpCache {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        cache: Arc<CacheService>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            memory: TtlCache::new(config.cache.raw_dump_ttl_ms),
            ttl_ms: config.cache.raw_dump_ttl_ms,
            timeout: Duration::from_secs(config.command.shell_timeout_secs),
        }
    }

    pub async fn fetch(&self, serial: &str, trace_id: &str) -> Result<String, AppError> {
        if let Some(dump) = self.memory.get(&serial.to_string()) {
            return Ok(dump);
        }

        let mirror = self.cache.dumpsys_mirror_path(serial);
        if let Some(entry) = self.cache.read_json::<String>(&mirror) {
            if entry.is_fresh(self.ttl_ms, now_ms()) {
                self.memory.put(serial.to_string(), entry.payload.clone());
                return Ok(entry.payload);
            }
        }

        let output = adb::shell(
            self.executor.as_ref(),
            serial,
            RAW_DUMP_COMMAND,
            self.timeout,
            trace_id,
        )
        .await?;

        self.memory.put(serial.to_string(), output.stdout.clone());
        self.cache.write_json(&mirror, &output.stdout);
        Ok(output.stdout)
    }

    pub fn invalidate(&self, serial: &str) {
        self.memory.evict(&serial.to_string());
    }
}
