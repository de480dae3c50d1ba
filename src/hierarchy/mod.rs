pub mod enrich;
pub mod filter;
pub mod parse;
pub mod score;

use std::sync::Arc;
use std::time::Duration;

use image_hasher::{HashAlg, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};

use crate::accessibility::AccessibilityChannel;
use crate::adb::{self, DeviceExecutor};
use crate::cache::{hash_key, now_ms, CacheService, TtlCache};
use crate::config::ObserverConfig;
use crate::models::HierarchyResult;

const DEVICE_DUMP_PATH: &str = "/sdcard/window_dump.xml";
const SCREEN_OFF_MESSAGE: &str = "screen appears to be off or device is locked";
const GENERIC_FAILURE_MESSAGE: &str = "failed to retrieve view hierarchy";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedHierarchy {
    result: HierarchyResult,
    phash: Option<String>,
    fetched_at_ms: i64,
}

/// Fetches, filters, enriches and scores the on-screen view hierarchy.
///
/// Results are keyed by a content hash of the screenshot taken alongside the
/// dump, so visually identical states reuse each other's hierarchies. When
/// the exact hash misses, a perceptual-hash search over recent entries runs
/// before a fresh device round trip.
pub struct HierarchyProcessor {
    executor: Arc<dyn DeviceExecutor>,
    cache: Arc<CacheService>,
    accessibility: AccessibilityChannel,
    memory: TtlCache<String, CachedHierarchy>,
    ttl_ms: u64,
    phash_max_distance: u32,
    shell_timeout: Duration,
    dump_timeout: Duration,
}

impl HierarchyProcessor {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        cache: Arc<CacheService>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            accessibility: AccessibilityChannel::new(executor.clone(), config),
            executor,
            cache,
            memory: TtlCache::new(config.cache.hierarchy_ttl_ms),
            ttl_ms: config.cache.hierarchy_ttl_ms,
            phash_max_distance: config.cache.phash_max_distance,
            shell_timeout: Duration::from_secs(config.command.shell_timeout_secs),
            dump_timeout: Duration::from_secs(config.command.hierarchy_timeout_secs),
        }
    }

    /// `None` means the hierarchy could not satisfy `min_timestamp_ms`, not
    /// that the probe failed; failures come back as the `error` field of an
    /// otherwise well-formed result.
    pub async fn get(
        &self,
        serial: &str,
        screenshot: Option<&[u8]>,
        min_timestamp_ms: Option<i64>,
        trace_id: &str,
    ) -> Option<HierarchyResult> {
        let exact_key = screenshot.map(|bytes| hash_key(bytes));
        let phash = screenshot.and_then(perceptual_hash);

        if let Some(key) = exact_key.as_deref() {
            if let Some(cached) = self.lookup(key, phash.as_deref(), min_timestamp_ms) {
                return Some(cached.result);
            }
        }

        let result = self.fetch(serial, min_timestamp_ms, trace_id).await?;

        if result.root.is_some() {
            if let Some(key) = exact_key {
                let cached = CachedHierarchy {
                    result: result.clone(),
                    phash,
                    fetched_at_ms: now_ms(),
                };
                self.cache
                    .write_json(&self.cache.hierarchy_dir().join(format!("{key}.json")), &cached);
                self.memory.put(key, cached);
            }
        }
        Some(result)
    }

    pub fn clear(&self) {
        self.memory.clear();
    }

    fn lookup(
        &self,
        key: &str,
        phash: Option<&str>,
        min_timestamp_ms: Option<i64>,
    ) -> Option<CachedHierarchy> {
        let satisfies = |cached: &CachedHierarchy| {
            min_timestamp_ms.is_none_or(|min| cached.fetched_at_ms >= min)
        };

        if let Some(cached) = self.memory.get(&key.to_string()) {
            if satisfies(&cached) {
                return Some(cached);
            }
        }

        if let Some(query) = phash {
            for (_, cached) in self.memory.recent() {
                let close = cached
                    .phash
                    .as_deref()
                    .is_some_and(|stored| hamming_distance(query, stored) <= self.phash_max_distance);
                if close && satisfies(&cached) {
                    return Some(cached);
                }
            }
        }

        let path = self.cache.hierarchy_dir().join(format!("{key}.json"));
        if let Some(entry) = self.cache.read_json::<CachedHierarchy>(&path) {
            if entry.is_fresh(self.ttl_ms, now_ms()) && satisfies(&entry.payload) {
                self.memory.put(key.to_string(), entry.payload.clone());
                return Some(entry.payload);
            }
        }

        // Fuzzy reuse extends to mirror entries an earlier process wrote.
        if let Some(query) = phash {
            let mut recent: Vec<CachedHierarchy> = Vec::new();
            if let Ok(entries) = std::fs::read_dir(self.cache.hierarchy_dir()) {
                let now = now_ms();
                for entry in entries.flatten() {
                    let Some(stored) = self.cache.read_json::<CachedHierarchy>(&entry.path())
                    else {
                        continue;
                    };
                    if stored.is_fresh(self.ttl_ms, now) {
                        recent.push(stored.payload);
                    }
                }
            }
            recent.sort_by_key(|cached| std::cmp::Reverse(cached.fetched_at_ms));
            for cached in recent {
                let close = cached
                    .phash
                    .as_deref()
                    .is_some_and(|stored| hamming_distance(query, stored) <= self.phash_max_distance);
                if close && satisfies(&cached) {
                    self.memory.put(key.to_string(), cached.clone());
                    return Some(cached);
                }
            }
        }
        None
    }

    async fn fetch(
        &self,
        serial: &str,
        min_timestamp_ms: Option<i64>,
        trace_id: &str,
    ) -> Option<HierarchyResult> {
        // The service writes a fresh dump per request, so the mtime gate
        // below only applies to the uiautomator path.
        if self.accessibility.is_enabled() {
            match self.accessibility.fetch(serial, trace_id).await {
                Ok(result) if result.root.is_some() => return Some(result),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(serial, error = %err, "Accessibility channel unavailable, using uiautomator");
                }
            }
        }

        let command = format!("uiautomator dump {DEVICE_DUMP_PATH} && cat {DEVICE_DUMP_PATH}");
        let output = match adb::shell(
            self.executor.as_ref(),
            serial,
            &command,
            self.dump_timeout,
            trace_id,
        )
        .await
        {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(serial, error = %err, "Hierarchy dump failed");
                return Some(failure(GENERIC_FAILURE_MESSAGE));
            }
        };

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        if combined.contains("null root node") || combined.contains("No such file") {
            return Some(failure(SCREEN_OFF_MESSAGE));
        }

        if let Some(min) = min_timestamp_ms {
            match self.device_dump_mtime_ms(serial, trace_id).await {
                Some(mtime) if mtime < min => {
                    tracing::debug!(serial, mtime, min, "Hierarchy dump predates constraint");
                    return None;
                }
                _ => {}
            }
        }

        let xml_start = output
            .stdout
            .find("<?xml")
            .or_else(|| output.stdout.find("<hierarchy"));
        let Some(start) = xml_start else {
            return Some(failure(GENERIC_FAILURE_MESSAGE));
        };

        let raw = match parse::parse_ui_dump(&output.stdout[start..]) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(serial, error = %err, "Hierarchy dump did not parse");
                return Some(failure(GENERIC_FAILURE_MESSAGE));
            }
        };

        let mut root = filter::filter_tree(&raw);
        if let Some(node) = root.as_mut() {
            if let Some(view_tree) = self.fetch_view_tree(serial, trace_id).await {
                enrich::enrich_tree(node, &view_tree);
            }
            score::annotate_scores(node);
        }

        Some(HierarchyResult { root, error: None })
    }

    /// The view-tree dump is additive detail; losing it degrades class names
    /// but never fails the hierarchy request.
    async fn fetch_view_tree(&self, serial: &str, trace_id: &str) -> Option<enrich::ViewTree> {
        match adb::shell(
            self.executor.as_ref(),
            serial,
            "dumpsys activity top",
            self.shell_timeout,
            trace_id,
        )
        .await
        {
            Ok(output) => Some(enrich::parse_view_tree(&output.stdout)),
            Err(err) => {
                tracing::debug!(serial, error = %err, "View-tree dump unavailable");
                None
            }
        }
    }

    async fn device_dump_mtime_ms(&self, serial: &str, trace_id: &str) -> Option<i64> {
        let command = format!("stat -c %Y {DEVICE_DUMP_PATH}");
        let output = adb::shell(
            self.executor.as_ref(),
            serial,
            &command,
            self.shell_timeout,
            trace_id,
        )
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

fn failure(message: &str) -> HierarchyResult {
    HierarchyResult {
        root: None,
        error: Some(message.to_string()),
    }
}

fn perceptual_hash(bytes: &[u8]) -> Option<String> {
    let img = image::load_from_memory(bytes).ok()?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    Some(hasher.hash_image(&img).to_base64())
}

fn hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(first) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(second) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    first.dist(&second)
}
