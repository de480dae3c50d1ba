use std::collections::BTreeMap;

use crate::hierarchy::parse::{normalize_bounds_text, RawNode};
use crate::models::{Children, HierarchyNode};

/// A node with more direct children than this is almost always a virtualized
/// list; the overflow adds noise without adding automatable targets.
pub const MAX_CHILDREN: usize = 64;

const TEXT_ATTRS: &[&str] = &["text", "content-desc", "resource-id"];

const FLAG_ATTRS: &[&str] = &[
    "clickable",
    "scrollable",
    "focusable",
    "focused",
    "checkable",
    "checked",
    "selected",
    "long-clickable",
    "password",
];

/// Reduces a raw dump tree to the interesting nodes. Uninteresting nodes are
/// collapsed: their surviving descendants are promoted into the nearest kept
/// ancestor, so depth shrinks but document order is preserved.
pub fn filter_tree(root: &RawNode) -> Option<HierarchyNode> {
    let mut survivors = filter_node(root);
    match survivors.len() {
        0 => None,
        1 => Some(survivors.remove(0)),
        _ => {
            // Several siblings bubbled past an uninteresting root; keep the
            // root as a plain container so the result stays a single tree.
            Some(HierarchyNode {
                attrs: normalize_attrs(root),
                children: Children::from_vec(survivors),
            })
        }
    }
}

fn filter_node(raw: &RawNode) -> Vec<HierarchyNode> {
    let mut promoted = Vec::new();
    for child in &raw.children {
        promoted.extend(filter_node(child));
        if promoted.len() >= MAX_CHILDREN {
            promoted.truncate(MAX_CHILDREN);
            break;
        }
    }

    let attrs = normalize_attrs(raw);
    if !is_interesting(&attrs) {
        return promoted;
    }

    vec![HierarchyNode {
        attrs,
        children: Children::from_vec(promoted),
    }]
}

fn is_interesting(attrs: &BTreeMap<String, String>) -> bool {
    let has_text = TEXT_ATTRS
        .iter()
        .any(|name| attrs.get(*name).is_some_and(|value| !value.is_empty()));
    let has_flag = FLAG_ATTRS
        .iter()
        .any(|name| attrs.get(*name).is_some_and(|value| is_true(value)));
    has_text || has_flag
}

fn is_true(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

/// Maps both the XML hyphenated names and the JSON camel-case names onto one
/// canonical attribute set, dropping everything else.
fn normalize_attrs(raw: &RawNode) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();

    let mut copy_text = |canonical: &str, sources: &[&str]| {
        for source in sources {
            if let Some(value) = raw.attr(source) {
                if !value.is_empty() {
                    attrs.insert(canonical.to_string(), value.to_string());
                    return;
                }
            }
        }
    };

    copy_text("text", &["text", "label", "title", "AXLabel"]);
    copy_text(
        "resource-id",
        &["resource-id", "resourceId", "identifier", "AXUniqueId"],
    );
    copy_text(
        "content-desc",
        &["content-desc", "contentDescription", "accessibilityLabel"],
    );
    copy_text("class", &["class", "className", "type"]);
    copy_text("package", &["package", "packageName"]);

    if let Some(bounds) = raw
        .attr("bounds")
        .or_else(|| raw.attr("frame"))
        .and_then(normalize_bounds_text)
    {
        attrs.insert("bounds".to_string(), bounds);
    }

    for flag in FLAG_ATTRS {
        if let Some(value) = raw.attr(flag).or_else(|| raw.attr(&camel_case(flag))) {
            attrs.insert(
                (*flag).to_string(),
                is_true(value).to_string(),
            );
        }
    }
    if let Some(value) = raw.attr("enabled") {
        attrs.insert("enabled".to_string(), is_true(value).to_string());
    }

    attrs
}

fn camel_case(hyphenated: &str) -> String {
    let mut out = String::with_capacity(hyphenated.len());
    let mut upper_next = false;
    for ch in hyphenated.chars() {
        if ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(attrs: &[(&str, &str)], children: Vec<RawNode>) -> RawNode {
        RawNode {
            tag: "node".to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children,
        }
    }

    #[test]
    fn uninteresting_layers_collapse_into_kept_ancestors() {
        let tree = raw(
            &[("text", "Screen"), ("bounds", "[0,0][1080,2400]")],
            vec![raw(
                &[("class", "android.widget.FrameLayout")],
                vec![raw(
                    &[("class", "android.widget.LinearLayout")],
                    vec![raw(
                        &[("text", "Sign in"), ("clickable", "true")],
                        vec![],
                    )],
                )],
            )],
        );

        let filtered = filter_tree(&tree).expect("kept");
        assert_eq!(filtered.attr("text"), Some("Screen"));
        assert_eq!(filtered.children.len(), 1);
        let child = filtered.children.iter().next().expect("child");
        assert_eq!(child.attr("text"), Some("Sign in"));
        assert!(child.children.is_empty());
    }

    #[test]
    fn empty_text_and_false_flags_are_not_interesting() {
        let tree = raw(
            &[("text", ""), ("clickable", "false"), ("class", "View")],
            vec![],
        );
        assert!(filter_tree(&tree).is_none());
    }

    #[test]
    fn multiple_survivors_keep_the_root_as_container() {
        let tree = raw(
            &[("class", "android.widget.FrameLayout")],
            vec![
                raw(&[("text", "One")], vec![]),
                raw(&[("text", "Two")], vec![]),
            ],
        );
        let filtered = filter_tree(&tree).expect("kept");
        assert_eq!(filtered.attr("text"), None);
        assert_eq!(filtered.children.len(), 2);
    }

    #[test]
    fn child_count_is_capped() {
        let children: Vec<RawNode> = (0..200)
            .map(|n| raw(&[("text", &format!("item {n}"))], vec![]))
            .collect();
        let tree = raw(&[("scrollable", "true")], children);
        let filtered = filter_tree(&tree).expect("kept");
        assert_eq!(filtered.children.len(), MAX_CHILDREN);
    }

    #[test]
    fn camel_case_attributes_normalize_to_canonical_names() {
        let tree = raw(
            &[
                ("resourceId", "com.example:id/ok"),
                ("contentDescription", "Confirm"),
                ("className", "android.widget.Button"),
                ("longClickable", "true"),
                ("bounds", "[0, 0][100, 50]"),
            ],
            vec![],
        );
        let filtered = filter_tree(&tree).expect("kept");
        assert_eq!(filtered.attr("resource-id"), Some("com.example:id/ok"));
        assert_eq!(filtered.attr("content-desc"), Some("Confirm"));
        assert_eq!(filtered.attr("long-clickable"), Some("true"));
        assert_eq!(filtered.attr("bounds"), Some("[0,0][100,50]"));
        assert_eq!(filtered.attr("className"), None);
    }

    #[test]
    fn filtering_is_idempotent() {
        let tree = raw(
            &[("text", "Root")],
            vec![raw(
                &[("class", "Layout")],
                vec![raw(&[("text", "Leaf"), ("clickable", "true")], vec![])],
            )],
        );
        let once = filter_tree(&tree).expect("kept");

        // Re-run over a raw view of the filtered output.
        fn back_to_raw(node: &HierarchyNode) -> RawNode {
            RawNode {
                tag: "node".to_string(),
                attrs: node.attrs.clone(),
                children: node.children.iter().map(back_to_raw).collect(),
            }
        }
        let twice = filter_tree(&back_to_raw(&once)).expect("kept");
        assert_eq!(once, twice);
    }
}
