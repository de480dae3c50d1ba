use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceTarget {
    pub serial: String,
    pub platform: Platform,
}

impl DeviceTarget {
    pub fn android(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            platform: Platform::Android,
        }
    }

    pub fn ios(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            platform: Platform::Ios,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Insets {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveWindowInfo {
    pub package_name: String,
    pub activity_name: String,
    /// Running total of every mLayoutSeq counter in the window dump. Cheap
    /// "did anything relayout" signal; not meaningful in absolute terms.
    pub layout_seq_sum: u64,
}

impl ActiveWindowInfo {
    pub fn is_empty(&self) -> bool {
        self.package_name.is_empty() && self.activity_name.is_empty()
    }
}

/// One point-in-time snapshot of device screen state.
///
/// Screen size and insets are always present (zero-valued when unknown) so
/// consumers never null-check them. Every other field's absence means the
/// probe was unavailable, not "unknown".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub timestamp_ms: i64,
    pub screen_size: ScreenSize,
    pub insets: Insets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<HierarchyNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focused_element: Option<HierarchyNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_window: Option<ActiveWindowInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_chooser_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Observation {
    pub fn zero_valued(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            ..Self::default()
        }
    }

    pub fn push_error(&mut self, probe: &str, message: impl AsRef<str>) {
        self.errors.push(format!("{probe}: {}", message.as_ref()));
    }

    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub missed_vsync: u64,
    pub slow_ui_thread: u64,
    pub frame_deadline_missed: u64,
}

/// One reading of an app's rendering statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StabilitySample {
    pub counters: CounterSnapshot,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    /// Parsed for diagnostics only; excluded from the stability decision.
    pub p99_ms: Option<f64>,
}

/// Counters carried forward across polls so deltas are always relative to
/// the most recent sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StabilityState {
    pub last: Option<CounterSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StabilityVerdict {
    pub stable: bool,
    /// True when the sample was unusable and the caller should reset its
    /// last-non-idle timestamp and keep polling.
    pub reset_last_active: bool,
}

impl StabilityVerdict {
    pub fn stable() -> Self {
        Self {
            stable: true,
            reset_last_active: false,
        }
    }

    pub fn unstable() -> Self {
        Self {
            stable: false,
            reset_last_active: false,
        }
    }

    pub fn insufficient_data() -> Self {
        Self {
            stable: false,
            reset_last_active: true,
        }
    }
}

/// Child representation of a hierarchy node.
///
/// A node with exactly one child after filtering serializes as that single
/// object, never as a one-element array. Older consumers depend on the
/// asymmetry, so it is a sum type rather than an array-length check.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Children {
    #[default]
    None,
    One(Box<HierarchyNode>),
    Many(Vec<HierarchyNode>),
}

impl Children {
    pub fn from_vec(mut nodes: Vec<HierarchyNode>) -> Self {
        match nodes.len() {
            0 => Children::None,
            1 => Children::One(Box::new(nodes.remove(0))),
            _ => Children::Many(nodes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Children::None => 0,
            Children::One(_) => 1,
            Children::Many(nodes) => nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Children::None)
    }

    pub fn iter(&self) -> ChildIter<'_> {
        ChildIter {
            children: self,
            index: 0,
        }
    }

    pub fn into_vec(self) -> Vec<HierarchyNode> {
        match self {
            Children::None => Vec::new(),
            Children::One(node) => vec![*node],
            Children::Many(nodes) => nodes,
        }
    }
}

pub struct ChildIter<'a> {
    children: &'a Children,
    index: usize,
}

impl<'a> Iterator for ChildIter<'a> {
    type Item = &'a HierarchyNode;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.children {
            Children::None => None,
            Children::One(node) => {
                if self.index == 0 {
                    Some(node.as_ref())
                } else {
                    None
                }
            }
            Children::Many(nodes) => nodes.get(self.index),
        };
        if item.is_some() {
            self.index += 1;
        }
        item
    }
}

/// A filtered accessibility/UI-dump node: normalized string attributes plus
/// zero, one, or many children under the `node` key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HierarchyNode {
    pub attrs: BTreeMap<String, String>,
    pub children: Children,
}

impl HierarchyNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.attrs {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        match &self.children {
            Children::None => {}
            Children::One(node) => {
                map.insert("node".to_string(), node.to_value());
            }
            Children::Many(nodes) => {
                map.insert(
                    "node".to_string(),
                    serde_json::Value::Array(nodes.iter().map(|n| n.to_value()).collect()),
                );
            }
        }
        serde_json::Value::Object(map)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| "hierarchy node must be an object".to_string())?;
        let mut node = HierarchyNode::default();
        for (key, entry) in map {
            if key == "node" {
                node.children = match entry {
                    serde_json::Value::Array(items) => {
                        let mut children = Vec::with_capacity(items.len());
                        for item in items {
                            children.push(HierarchyNode::from_value(item)?);
                        }
                        Children::Many(children)
                    }
                    serde_json::Value::Object(_) => {
                        Children::One(Box::new(HierarchyNode::from_value(entry)?))
                    }
                    other => return Err(format!("invalid node children: {other}")),
                };
                continue;
            }
            let text = match entry {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            node.attrs.insert(key.clone(), text);
        }
        Ok(node)
    }
}

impl Serialize for HierarchyNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let extra = usize::from(!self.children.is_empty());
        let mut map = serializer.serialize_map(Some(self.attrs.len() + extra))?;
        for (key, value) in &self.attrs {
            map.serialize_entry(key, value)?;
        }
        match &self.children {
            Children::None => {}
            Children::One(node) => map.serialize_entry("node", node.as_ref())?,
            Children::Many(nodes) => map.serialize_entry("node", nodes)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HierarchyNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        HierarchyNode::from_value(&value).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HierarchyResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<HierarchyNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Png,
    Webp,
}

impl CaptureFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureFormat::Png => "png",
            CaptureFormat::Webp => "webp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureOptions {
    pub format: CaptureFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lossless: Option<bool>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            format: CaptureFormat::Png,
            quality: None,
            lossless: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptureResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(text: &str) -> HierarchyNode {
        let mut node = HierarchyNode::default();
        node.set_attr("text", text);
        node
    }

    #[test]
    fn single_child_serializes_as_object_not_array() {
        let mut root = HierarchyNode::default();
        root.set_attr("class", "android.widget.FrameLayout");
        root.children = Children::from_vec(vec![leaf("OK")]);

        let value = serde_json::to_value(&root).expect("serialize");
        assert!(value["node"].is_object());
        assert_eq!(value["node"]["text"], "OK");
    }

    #[test]
    fn multiple_children_serialize_as_array() {
        let mut root = HierarchyNode::default();
        root.children = Children::from_vec(vec![leaf("A"), leaf("B")]);

        let value = serde_json::to_value(&root).expect("serialize");
        assert!(value["node"].is_array());
        assert_eq!(value["node"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn deserializes_both_child_shapes() {
        let raw = r#"{"class":"x","node":{"text":"only"}}"#;
        let node: HierarchyNode = serde_json::from_str(raw).expect("single");
        assert!(matches!(node.children, Children::One(_)));

        let raw = r#"{"class":"x","node":[{"text":"a"},{"text":"b"}]}"#;
        let node: HierarchyNode = serde_json::from_str(raw).expect("many");
        assert_eq!(node.children.len(), 2);
    }

    #[test]
    fn observation_defaults_to_zero_valued_geometry() {
        let observation = Observation::zero_valued(42);
        assert_eq!(observation.screen_size, ScreenSize::default());
        assert_eq!(observation.insets, Insets::default());
        assert!(observation.rotation.is_none());
        assert!(observation.errors.is_empty());
    }

    #[test]
    fn error_summary_joins_fragments() {
        let mut observation = Observation::zero_valued(0);
        assert_eq!(observation.error_summary(), None);
        observation.push_error("screenshot", "capture failed");
        observation.push_error("hierarchy", "dump empty");
        assert_eq!(
            observation.error_summary().as_deref(),
            Some("screenshot: capture failed; hierarchy: dump empty")
        );
    }

    #[test]
    fn children_from_vec_collapses_shapes() {
        assert!(Children::from_vec(Vec::new()).is_empty());
        assert!(matches!(
            Children::from_vec(vec![leaf("x")]),
            Children::One(_)
        ));
        assert!(matches!(
            Children::from_vec(vec![leaf("x"), leaf("y")]),
            Children::Many(_)
        ));
    }
}
