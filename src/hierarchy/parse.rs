use std::collections::BTreeMap;

/// Unfiltered node straight out of a UI dump, before the interesting-node
/// filter and attribute normalization run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<RawNode>,
}

impl RawNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// A dump without the expected root tag is a hard failure, never a silently
/// empty tree.
pub fn validate_ui_dump(xml: &str) -> Result<(), String> {
    if xml.trim().is_empty() {
        return Err("UI dump is empty".to_string());
    }
    if !xml.contains("<hierarchy") {
        return Err("UI dump has no hierarchy root element".to_string());
    }
    Ok(())
}

/// Streaming scan of a uiautomator dump into a node tree. The dump grammar
/// is narrow enough that a byte cursor beats a full XML dependency.
pub fn parse_ui_dump(xml: &str) -> Result<RawNode, String> {
    validate_ui_dump(xml)?;

    let bytes = xml.as_bytes();
    let mut index: usize = 0;
    let mut stack: Vec<RawNode> = Vec::new();
    let mut root: Option<RawNode> = None;

    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        if index + 1 >= bytes.len() {
            break;
        }
        match bytes[index + 1] {
            b'/' => {
                index += 2;
                while index < bytes.len() && bytes[index] != b'>' {
                    index += 1;
                }
                if index < bytes.len() {
                    index += 1;
                }
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut root, node)?;
                }
            }
            b'!' => {
                index += 2;
                while index + 2 < bytes.len()
                    && !(bytes[index] == b'-'
                        && bytes[index + 1] == b'-'
                        && bytes[index + 2] == b'>')
                {
                    index += 1;
                }
                index = (index + 3).min(bytes.len());
            }
            b'?' => {
                index += 2;
                while index + 1 < bytes.len() && !(bytes[index] == b'?' && bytes[index + 1] == b'>')
                {
                    index += 1;
                }
                index = (index + 2).min(bytes.len());
            }
            _ => {
                let start = index + 1;
                let mut cursor = start;
                while cursor < bytes.len() {
                    let ch = bytes[cursor];
                    if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
                        break;
                    }
                    cursor += 1;
                }
                let tag = xml[start..cursor].to_string();
                let (attrs, self_closing, next) = parse_attrs(xml, bytes, cursor)?;
                index = next;

                let node = RawNode {
                    tag,
                    attrs,
                    children: Vec::new(),
                };
                if self_closing {
                    attach(&mut stack, &mut root, node)?;
                } else {
                    stack.push(node);
                }
            }
        }
    }

    while let Some(node) = stack.pop() {
        attach(&mut stack, &mut root, node)?;
    }

    root.ok_or_else(|| "UI dump contained no elements".to_string())
}

fn attach(
    stack: &mut [RawNode],
    root: &mut Option<RawNode>,
    node: RawNode,
) -> Result<(), String> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else if root.is_none() {
        *root = Some(node);
    }
    Ok(())
}

fn parse_attrs(
    xml: &str,
    bytes: &[u8],
    mut cursor: usize,
) -> Result<(BTreeMap<String, String>, bool, usize), String> {
    let mut attrs = BTreeMap::new();
    let mut self_closing = false;

    while cursor < bytes.len() {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let ch = bytes[cursor];
        if ch == b'>' {
            cursor += 1;
            break;
        }
        if ch == b'/' {
            self_closing = true;
            cursor += 1;
            if cursor < bytes.len() && bytes[cursor] == b'>' {
                cursor += 1;
            }
            break;
        }

        let name_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != b'=' && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return Err("Malformed attribute".to_string());
        }
        let name_end = cursor;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            return Err("Malformed attribute assignment".to_string());
        }
        cursor += 1;
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return Err("Missing attribute value".to_string());
        }
        let quote = bytes[cursor];
        if quote != b'"' && quote != b'\'' {
            return Err("Attribute value must be quoted".to_string());
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != quote {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return Err("Unterminated attribute value".to_string());
        }
        let name = xml[name_start..name_end].to_string();
        let value = unescape_xml(&xml[value_start..cursor]);
        cursor += 1;
        attrs.insert(name, value);
    }

    Ok((attrs, self_closing, cursor))
}

fn unescape_xml(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Object-shaped node source: the accessibility-service channel and the iOS
/// describe output both deliver JSON instead of XML.
pub fn parse_json_node(value: &serde_json::Value) -> Result<RawNode, String> {
    let map = value
        .as_object()
        .ok_or_else(|| "node payload must be an object".to_string())?;
    let mut node = RawNode {
        tag: "node".to_string(),
        ..RawNode::default()
    };
    for (key, entry) in map {
        if key == "children" || key == "node" {
            let items = match entry {
                serde_json::Value::Array(items) => items.iter().collect::<Vec<_>>(),
                serde_json::Value::Object(_) => vec![entry],
                serde_json::Value::Null => Vec::new(),
                other => return Err(format!("invalid children payload: {other}")),
            };
            for item in items {
                node.children.push(parse_json_node(item)?);
            }
            continue;
        }
        let text = match entry {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Object(_) if key == "bounds" || key == "frame" => {
                match normalize_bounds_value(entry) {
                    Some(bounds) => bounds,
                    None => continue,
                }
            }
            serde_json::Value::Null => continue,
            other => other.to_string(),
        };
        node.attrs.insert(key.clone(), text);
    }
    Ok(node)
}

pub fn format_bounds(left: i32, top: i32, right: i32, bottom: i32) -> String {
    format!("[{left},{top}][{right},{bottom}]")
}

/// Parses the canonical `[l,t][r,b]` form, tolerating stray whitespace.
pub fn parse_bounds(text: &str) -> Option<(i32, i32, i32, i32)> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let rest = cleaned.strip_prefix('[')?;
    let (first, rest) = rest.split_once("][")?;
    let second = rest.strip_suffix(']')?;
    let (left, top) = first.split_once(',')?;
    let (right, bottom) = second.split_once(',')?;
    Some((
        left.parse().ok()?,
        top.parse().ok()?,
        right.parse().ok()?,
        bottom.parse().ok()?,
    ))
}

pub fn normalize_bounds_text(text: &str) -> Option<String> {
    let (left, top, right, bottom) = parse_bounds(text)?;
    Some(format_bounds(left, top, right, bottom))
}

/// Canonical bracket-pair form from either rect shape: `{left,top,right,
/// bottom}` or `{x,y,width,height}`.
pub fn normalize_bounds_value(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value.as_str() {
        return normalize_bounds_text(text);
    }
    let map = value.as_object()?;
    let field = |name: &str| map.get(name).and_then(|v| v.as_f64()).map(|v| v as i32);
    if let (Some(left), Some(top), Some(right), Some(bottom)) =
        (field("left"), field("top"), field("right"), field("bottom"))
    {
        return Some(format_bounds(left, top, right, bottom));
    }
    if let (Some(x), Some(y), Some(width), Some(height)) =
        (field("x"), field("y"), field("width"), field("height"))
    {
        return Some(format_bounds(x, y, x + width, y + height));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" bounds="[0,0][1080,2400]">
    <node index="0" text="Sign in" resource-id="com.example.app:id/login" class="android.widget.Button" clickable="true" bounds="[40,2100][1040,2250]" />
    <node index="1" text="A &amp; B" resource-id="" class="android.widget.TextView" bounds="[40,100][1040,200]" />
  </node>
</hierarchy>
"#;

    #[test]
    fn parses_dump_into_tree() {
        let root = parse_ui_dump(DUMP).expect("parse");
        assert_eq!(root.tag, "hierarchy");
        assert_eq!(root.attr("rotation"), Some("0"));
        assert_eq!(root.children.len(), 1);
        let frame = &root.children[0];
        assert_eq!(frame.children.len(), 2);
        assert_eq!(frame.children[0].attr("text"), Some("Sign in"));
        assert_eq!(frame.children[1].attr("text"), Some("A & B"));
    }

    #[test]
    fn rejects_empty_and_rootless_dumps() {
        assert!(parse_ui_dump("").is_err());
        assert!(parse_ui_dump("   \n").is_err());
        assert!(parse_ui_dump("<node text='x' />").is_err());
    }

    #[test]
    fn parses_json_shaped_nodes() {
        let value = serde_json::json!({
            "className": "android.widget.Button",
            "text": "OK",
            "clickable": true,
            "bounds": {"left": 0, "top": 10, "right": 100, "bottom": 60},
            "children": [
                {"text": "inner", "bounds": {"x": 5, "y": 15, "width": 20, "height": 10}}
            ]
        });
        let node = parse_json_node(&value).expect("parse");
        assert_eq!(node.attr("clickable"), Some("true"));
        assert_eq!(node.attr("bounds"), Some("[0,10][100,60]"));
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].attr("bounds"), Some("[5,15][25,25]"));
    }

    #[test]
    fn bounds_round_trip_both_shapes() {
        assert_eq!(
            normalize_bounds_text(" [0, 0][1080, 2400] ").as_deref(),
            Some("[0,0][1080,2400]")
        );
        assert_eq!(normalize_bounds_text("garbage"), None);
        let object = serde_json::json!({"left": 1, "top": 2, "right": 3, "bottom": 4});
        assert_eq!(
            normalize_bounds_value(&object).as_deref(),
            Some("[1,2][3,4]")
        );
    }

    #[test]
    fn parse_bounds_extracts_corners() {
        assert_eq!(parse_bounds("[40,2100][1040,2250]"), Some((40, 2100, 1040, 2250)));
        assert_eq!(parse_bounds("[oops]"), None);
    }
}
