use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adb::DeviceExecutor;
use crate::cache::{now_ms, CacheService, TtlCache};
use crate::config::ObserverConfig;
use crate::dumpsys::geometry;
use crate::dumpsys::raw::RawDumpCache;
use crate::error::AppError;
use crate::hierarchy::{filter, parse, score, HierarchyProcessor};
use crate::models::{
    CaptureOptions, DeviceTarget, HierarchyNode, Observation, Platform,
};
use crate::screenshot::ScreenshotCapturer;
use crate::window::ActiveWindowResolver;

/// Resource-id and package markers that identify the system share/open-with
/// picker. Text markers are avoided: they localize.
const INTENT_CHOOSER_MARKERS: &[&str] = &[
    "resolver_list",
    "chooser_header",
    "com.android.intentresolver",
    "com.android.internal.app.ChooserActivity",
    "com.android.internal.app.ResolverActivity",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObservation {
    serial: String,
    observation: Observation,
}

/// Top-level entry point: composes every probe into one `Observation`.
///
/// `observe` never raises. Individual probe failures append error fragments;
/// the rest of the result is still best-effort populated.
pub struct Observer {
    executor: Arc<dyn DeviceExecutor>,
    cache: Arc<CacheService>,
    raw_dump: RawDumpCache,
    window: ActiveWindowResolver,
    hierarchy: HierarchyProcessor,
    screenshot: ScreenshotCapturer,
    memory: TtlCache<String, Observation>,
    ttl_ms: u64,
    shell_timeout: Duration,
}

impl Observer {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        cache: Arc<CacheService>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            raw_dump: RawDumpCache::new(executor.clone(), cache.clone(), config),
            window: ActiveWindowResolver::new(executor.clone(), cache.clone(), config),
            hierarchy: HierarchyProcessor::new(executor.clone(), cache.clone(), config),
            screenshot: ScreenshotCapturer::new(executor.clone(), cache.clone(), config),
            memory: TtlCache::new(config.cache.observation_ttl_ms),
            ttl_ms: config.cache.observation_ttl_ms,
            shell_timeout: Duration::from_secs(config.command.shell_timeout_secs),
            executor,
            cache,
        }
    }

    pub async fn observe(&self, target: &DeviceTarget) -> Observation {
        let trace_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        let result = match target.platform {
            Platform::Android => self.observe_android(&target.serial, &trace_id).await,
            Platform::Ios => self.observe_ios(&target.serial, &trace_id).await,
        };
        let observation = match result {
            Ok(observation) => observation,
            Err(err) => {
                tracing::error!(serial = %target.serial, error = %err, "Observation failed outright");
                let mut observation = Observation::zero_valued(now_ms());
                observation.push_error("observe", "observation failed");
                observation
            }
        };

        tracing::info!(
            serial = %target.serial,
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = observation.errors.len(),
            "Observation complete"
        );
        self.remember(&target.serial, &observation);
        observation
    }

    /// Most recent still-fresh observation for a device. Expired entries are
    /// filtered out on read, never deleted from disk here.
    pub fn latest(&self, serial: &str) -> Option<Observation> {
        if let Some(observation) = self.memory.get(&serial.to_string()) {
            return Some(observation);
        }

        let dir = self.cache.observe_results_dir();
        let mut paths: Vec<_> = std::fs::read_dir(&dir)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .collect();
        // Timestamped names sort chronologically; newest first.
        paths.sort();
        paths.reverse();

        let now = now_ms();
        for path in paths {
            let Some(entry) = self.cache.read_json::<StoredObservation>(&path) else {
                continue;
            };
            if !entry.is_fresh(self.ttl_ms, now) {
                continue;
            }
            if entry.payload.serial == serial {
                let observation = entry.payload.observation;
                self.memory.put(serial.to_string(), observation.clone());
                return Some(observation);
            }
        }
        None
    }

    async fn observe_android(
        &self,
        serial: &str,
        trace_id: &str,
    ) -> Result<Observation, AppError> {
        let mut observation = Observation::zero_valued(now_ms());

        // The shared diagnostic dump goes out first; the window and
        // screenshot probes need none of it and run alongside.
        let capture_options = CaptureOptions::default();
        let (dump, active_window, capture) = tokio::join!(
            self.raw_dump.fetch(serial, trace_id),
            self.window.get_active(serial, false, trace_id),
            self.screenshot
                .capture(serial, &capture_options, trace_id),
        );

        observation.active_window = Some(active_window);

        let screenshot_bytes = if capture.success {
            observation.screenshot_path = capture.path.clone();
            capture
                .path
                .as_deref()
                .and_then(|path| std::fs::read(path).ok())
        } else {
            observation.push_error(
                "screenshot",
                capture.error.as_deref().unwrap_or("capture failed"),
            );
            None
        };

        let hierarchy = tokio::join!(
            async {
                match &dump {
                    Ok(text) => self.apply_geometry(&mut observation, text),
                    Err(err) => observation.push_error("window dump", &err.error),
                }
            },
            self.hierarchy
                .get(serial, screenshot_bytes.as_deref(), None, trace_id),
        )
        .1;

        if let Some(result) = hierarchy {
            if let Some(error) = result.error {
                observation.push_error("hierarchy", error);
            }
            if let Some(root) = result.root {
                observation.focused_element = find_focused(&root);
                observation.intent_chooser_visible = Some(is_intent_chooser(&root));
                observation.hierarchy = Some(root);
            }
        }

        Ok(observation)
    }

    fn apply_geometry(&self, observation: &mut Observation, dump: &str) {
        match geometry::parse_physical_dimensions(dump) {
            Ok(physical) => {
                let rotation = geometry::parse_rotation(dump);
                observation.rotation = rotation;
                let size = geometry::adjust_for_rotation(physical, rotation.unwrap_or(0));
                observation.screen_size = size;
                observation.insets = geometry::parse_insets(dump, size);
            }
            Err(err) => observation.push_error("geometry", err),
        }
    }

    async fn observe_ios(&self, serial: &str, trace_id: &str) -> Result<Observation, AppError> {
        let mut observation = Observation::zero_valued(now_ms());

        let describe_args = vec!["describe".to_string(), "--json".to_string()];
        let ui_args = vec![
            "ui".to_string(),
            "describe-all".to_string(),
            "--json".to_string(),
        ];
        let (describe, ui) = tokio::join!(
            self.executor
                .run(serial, &describe_args, self.shell_timeout, trace_id),
            self.executor
                .run(serial, &ui_args, self.shell_timeout, trace_id),
        );

        match describe {
            Ok(output) => match parse_ios_screen_size(&output.stdout) {
                Some(size) => observation.screen_size = size,
                None => observation.push_error("geometry", "no screen dimensions in describe output"),
            },
            Err(err) => observation.push_error("geometry", &err.error),
        }

        match ui {
            Ok(output) => match parse_ios_hierarchy(&output.stdout) {
                Ok(Some(root)) => {
                    observation.focused_element = find_focused(&root);
                    observation.hierarchy = Some(root);
                }
                Ok(None) => {}
                Err(err) => observation.push_error("hierarchy", err),
            },
            Err(err) => observation.push_error("hierarchy", &err.error),
        }

        Ok(observation)
    }

    fn remember(&self, serial: &str, observation: &Observation) {
        self.memory.put(serial.to_string(), observation.clone());
        let stored = StoredObservation {
            serial: serial.to_string(),
            observation: observation.clone(),
        };
        let path = self
            .cache
            .observe_results_dir()
            .join(format!("observe_{}.json", observation.timestamp_ms));
        self.cache.write_json(&path, &stored);
    }
}

fn parse_ios_screen_size(stdout: &str) -> Option<crate::models::ScreenSize> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let dimensions = value.get("screen_dimensions")?;
    Some(crate::models::ScreenSize {
        width: dimensions.get("width")?.as_i64()? as i32,
        height: dimensions.get("height")?.as_i64()? as i32,
    })
}

fn parse_ios_hierarchy(stdout: &str) -> Result<Option<HierarchyNode>, String> {
    let value: serde_json::Value =
        serde_json::from_str(stdout.trim()).map_err(|err| err.to_string())?;

    let raw = match value {
        serde_json::Value::Array(items) => {
            let mut children = Vec::with_capacity(items.len());
            for item in &items {
                children.push(parse::parse_json_node(item)?);
            }
            parse::RawNode {
                tag: "root".to_string(),
                attrs: Default::default(),
                children,
            }
        }
        object @ serde_json::Value::Object(_) => parse::parse_json_node(&object)?,
        other => return Err(format!("unexpected hierarchy payload: {other}")),
    };

    let mut root = filter::filter_tree(&raw);
    if let Some(node) = root.as_mut() {
        score::annotate_scores(node);
    }
    Ok(root)
}

fn find_focused(root: &HierarchyNode) -> Option<HierarchyNode> {
    if root.attr("focused") == Some("true") {
        let mut found = root.clone();
        found.children = Default::default();
        return Some(found);
    }
    root.children.iter().find_map(find_focused)
}

fn is_intent_chooser(root: &HierarchyNode) -> bool {
    let local_match = ["resource-id", "package", "class"].iter().any(|name| {
        root.attr(name).is_some_and(|value| {
            INTENT_CHOOSER_MARKERS
                .iter()
                .any(|marker| value.contains(marker))
        })
    });
    local_match || root.children.iter().any(is_intent_chooser)
}
