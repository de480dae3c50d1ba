use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adb::{self, DeviceExecutor};
use crate::cache::{hash_key, CacheService};
use crate::config::ObserverConfig;
use crate::dumpsys::window::{parse_foreground, sum_layout_seq};
use crate::models::ActiveWindowInfo;

const WINDOW_DUMP_COMMAND: &str = "dumpsys window";

/// Resolves the foreground package/activity. Results are mirrored in memory
/// and on disk per device so repeat callers skip the dumpsys round trip.
pub struct ActiveWindowResolver {
    executor: Arc<dyn DeviceExecutor>,
    cache: Arc<CacheService>,
    memory: Mutex<HashMap<String, ActiveWindowInfo>>,
    timeout: Duration,
}

impl ActiveWindowResolver {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        cache: Arc<CacheService>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            memory: Mutex::new(HashMap::new()),
            timeout: Duration::from_secs(config.command.shell_timeout_secs),
        }
    }

    /// Never fails: any probe error resolves to the zero-valued info.
    pub async fn get_active(
        &self,
        serial: &str,
        force_refresh: bool,
        trace_id: &str,
    ) -> ActiveWindowInfo {
        if !force_refresh {
            if let Some(info) = self.read_memory(serial) {
                return info;
            }
            let mirror = self.cache.window_mirror_path(serial);
            if let Some(entry) = self.cache.read_json::<ActiveWindowInfo>(&mirror) {
                self.write_memory(serial, &entry.payload);
                return entry.payload;
            }
        }

        match self.query_device(serial, trace_id).await {
            Some(info) => {
                self.write_memory(serial, &info);
                self.cache
                    .write_json(&self.cache.window_mirror_path(serial), &info);
                info
            }
            None => ActiveWindowInfo::default(),
        }
    }

    /// Always force-refreshes; callers use the hash for cheap "did the
    /// foreground window change" comparisons.
    pub async fn get_active_hash(&self, serial: &str, trace_id: &str) -> String {
        let info = self.get_active(serial, true, trace_id).await;
        hash_key(
            format!(
                "{}/{}:{}",
                info.package_name, info.activity_name, info.layout_seq_sum
            )
            .as_bytes(),
        )
    }

    pub fn clear(&self, serial: &str) {
        let mut guard = self.memory.lock().expect("window memory lock");
        guard.remove(serial);
        let _ = std::fs::remove_file(self.cache.window_mirror_path(serial));
    }

    async fn query_device(&self, serial: &str, trace_id: &str) -> Option<ActiveWindowInfo> {
        let output = match adb::shell(
            self.executor.as_ref(),
            serial,
            WINDOW_DUMP_COMMAND,
            self.timeout,
            trace_id,
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(serial, error = %err, "Active-window probe failed");
                return None;
            }
        };

        let layout_seq_sum = sum_layout_seq(&output.stdout);
        let (package_name, activity_name) = parse_foreground(&output.stdout).unwrap_or_default();
        Some(ActiveWindowInfo {
            package_name,
            activity_name,
            layout_seq_sum,
        })
    }

    fn read_memory(&self, serial: &str) -> Option<ActiveWindowInfo> {
        let guard = self.memory.lock().expect("window memory lock");
        guard.get(serial).cloned()
    }

    fn write_memory(&self, serial: &str, info: &ActiveWindowInfo) {
        let mut guard = self.memory.lock().expect("window memory lock");
        guard.insert(serial.to_string(), info.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::testing::FakeExecutor;

    const KEY: &str = "shell dumpsys window";

    const DUMP: &str = "\
  Window #0 Window{4d5e6f u0 com.example.app/com.example.app.MainActivity}\n\
    mAttrs={ty=BASE_APPLICATION}\n\
    isOnScreen=true\n\
    isVisible=true\n\
    mLayoutSeq=317\n";

    fn setup() -> (Arc<FakeExecutor>, ActiveWindowResolver, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(FakeExecutor::new());
        let cache = Arc::new(CacheService::new(dir.path().to_path_buf()));
        let resolver = ActiveWindowResolver::new(executor.clone(), cache, &ObserverConfig::default());
        (executor, resolver, dir)
    }

    #[tokio::test]
    async fn resolves_and_caches_in_memory() {
        let (executor, resolver, _dir) = setup();
        executor.on(KEY, DUMP);

        let info = resolver.get_active("emulator-5554", false, "t").await;
        assert_eq!(info.package_name, "com.example.app");
        assert_eq!(info.layout_seq_sum, 317);

        resolver.get_active("emulator-5554", false, "t").await;
        assert_eq!(executor.call_count(KEY), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_caches() {
        let (executor, resolver, _dir) = setup();
        executor.on(KEY, DUMP);
        resolver.get_active("emulator-5554", false, "t").await;
        resolver.get_active("emulator-5554", true, "t").await;
        assert_eq!(executor.call_count(KEY), 2);
    }

    #[tokio::test]
    async fn disk_mirror_serves_after_memory_clear() {
        let (executor, resolver, dir) = setup();
        executor.on(KEY, DUMP);
        resolver.get_active("emulator-5554", false, "t").await;

        // Simulate a process restart by clearing memory only.
        resolver.memory.lock().expect("lock").clear();
        let cache = Arc::new(CacheService::new(dir.path().to_path_buf()));
        let _ = cache;
        let info = resolver.get_active("emulator-5554", false, "t").await;
        assert_eq!(info.package_name, "com.example.app");
        assert_eq!(executor.call_count(KEY), 1);
    }

    #[tokio::test]
    async fn probe_failure_yields_zero_valued_info() {
        let (_executor, resolver, _dir) = setup();
        let info = resolver.get_active("emulator-5554", true, "t").await;
        assert!(info.is_empty());
        assert_eq!(info.layout_seq_sum, 0);
    }

    #[tokio::test]
    async fn hash_changes_with_layout_seq() {
        let (executor, resolver, _dir) = setup();
        executor.on(KEY, DUMP);
        executor.on(KEY, &DUMP.replace("317", "318"));

        let first = resolver.get_active_hash("emulator-5554", "t").await;
        let second = resolver.get_active_hash("emulator-5554", "t").await;
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }
}
