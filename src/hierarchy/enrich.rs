use std::collections::HashMap;

use regex::Regex;

use crate::hierarchy::parse::format_bounds;
use crate::models::{Children, HierarchyNode};

/// One view line out of the `dumpsys activity top` view hierarchy, with its
/// parent-relative bounds already accumulated to absolute coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInfo {
    pub class: String,
    pub id_hex: Option<String>,
    pub resource_id: Option<String>,
    pub bounds: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub name: String,
    pub container_id_hex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewTree {
    pub views: Vec<ViewInfo>,
    pub fragments: Vec<FragmentInfo>,
}

/// The view-tree dump knows things the accessibility dump does not: the true
/// (often app-specific) class of each view and which fragment hosts it.
pub fn parse_view_tree(dump: &str) -> ViewTree {
    let Ok(view_re) = Regex::new(
        r"(?m)^(\s*)([A-Za-z_$][\w.$]*)\{\S+ \S+(?: \S+)? (-?\d+),(-?\d+)-(-?\d+),(-?\d+)(?: #([0-9a-fA-F]+))?(?: ([\w.:/_-]+))?\}",
    ) else {
        return ViewTree::default();
    };
    let Ok(fragment_re) =
        Regex::new(r"(?m)^\s*#\d+:\s*(\w+)\{\S+(?:[^}]*?id=0x([0-9a-fA-F]+))?[^}]*\}")
    else {
        return ViewTree::default();
    };

    let mut views = Vec::new();
    // (indent, absolute left, absolute top) for the open ancestor chain.
    let mut stack: Vec<(usize, i64, i64)> = Vec::new();
    for caps in view_re.captures_iter(dump) {
        let indent = caps[1].len();
        while stack.last().is_some_and(|(depth, _, _)| *depth >= indent) {
            stack.pop();
        }
        let (origin_x, origin_y) = stack.last().map_or((0, 0), |(_, x, y)| (*x, *y));

        let (Ok(left), Ok(top), Ok(right), Ok(bottom)) = (
            caps[3].parse::<i64>(),
            caps[4].parse::<i64>(),
            caps[5].parse::<i64>(),
            caps[6].parse::<i64>(),
        ) else {
            continue;
        };
        let abs_left = origin_x + left;
        let abs_top = origin_y + top;
        let abs_right = origin_x + right;
        let abs_bottom = origin_y + bottom;
        stack.push((indent, abs_left, abs_top));

        views.push(ViewInfo {
            class: caps[2].to_string(),
            id_hex: caps.get(7).map(|m| m.as_str().to_ascii_lowercase()),
            resource_id: caps.get(8).map(|m| m.as_str().to_string()),
            bounds: format_bounds(
                abs_left as i32,
                abs_top as i32,
                abs_right as i32,
                abs_bottom as i32,
            ),
        });
    }

    let mut fragments = Vec::new();
    if let Some(section_start) = dump.find("Added Fragments:") {
        for caps in fragment_re.captures_iter(&dump[section_start..]) {
            fragments.push(FragmentInfo {
                name: caps[1].to_string(),
                container_id_hex: caps.get(2).map(|m| m.as_str().to_ascii_lowercase()),
            });
        }
    }

    ViewTree { views, fragments }
}

fn is_framework_class(class: &str) -> bool {
    class.starts_with("android.")
        || class.starts_with("androidx.")
        || class.starts_with("com.android.")
}

/// Trailing name segment of a resource id: both `app:id/login` and
/// `com.example.app:id/login` reduce to `login`.
fn resource_name(resource_id: &str) -> Option<&str> {
    resource_id.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Correlates the filtered tree with the view-tree dump and rewrites nodes in
/// place. Matching happens on resource-id name or exact absolute bounds. A
/// framework class name is upgraded to the app subclass the view tree saw;
/// framework-to-framework swaps never happen. Nodes living in a fragment's
/// container additionally get a `fragment` attribute.
pub fn enrich_tree(root: &mut HierarchyNode, tree: &ViewTree) {
    if tree.views.is_empty() {
        return;
    }

    let mut by_resource: HashMap<&str, &ViewInfo> = HashMap::new();
    let mut by_bounds: HashMap<&str, &ViewInfo> = HashMap::new();
    for view in &tree.views {
        if let Some(name) = view.resource_id.as_deref().and_then(resource_name) {
            by_resource.entry(name).or_insert(view);
        }
        by_bounds.entry(view.bounds.as_str()).or_insert(view);
    }

    // Fragment container hex ids resolve through the view list to resource
    // names, which is what the filtered nodes carry.
    let mut fragment_by_container: HashMap<String, &str> = HashMap::new();
    for fragment in &tree.fragments {
        let Some(container_hex) = fragment.container_id_hex.as_deref() else {
            continue;
        };
        let container_name = tree
            .views
            .iter()
            .find(|view| view.id_hex.as_deref() == Some(container_hex))
            .and_then(|view| view.resource_id.as_deref())
            .and_then(resource_name);
        if let Some(name) = container_name {
            fragment_by_container.insert(name.to_string(), fragment.name.as_str());
        }
    }

    enrich_node(root, &by_resource, &by_bounds, &fragment_by_container);
}

fn enrich_node(
    node: &mut HierarchyNode,
    by_resource: &HashMap<&str, &ViewInfo>,
    by_bounds: &HashMap<&str, &ViewInfo>,
    fragment_by_container: &HashMap<String, &str>,
) {
    let matched = node
        .attr("resource-id")
        .and_then(resource_name)
        .and_then(|name| by_resource.get(name).copied())
        .or_else(|| {
            node.attr("bounds")
                .and_then(|bounds| by_bounds.get(bounds).copied())
        });

    if let Some(view) = matched {
        let node_class_is_generic = node
            .attr("class")
            .map_or(true, is_framework_class);
        if node_class_is_generic
            && !is_framework_class(&view.class)
            && node.attr("class") != Some(view.class.as_str())
        {
            let class = view.class.clone();
            node.set_attr("class", class);
        }
    }

    if let Some(name) = node.attr("resource-id").and_then(resource_name) {
        if let Some(fragment) = fragment_by_container.get(name) {
            let fragment = fragment.to_string();
            node.set_attr("fragment", fragment);
        }
    }

    let children = std::mem::take(&mut node.children).into_vec();
    let mut rebuilt = Vec::with_capacity(children.len());
    for mut child in children {
        enrich_node(&mut child, by_resource, by_bounds, fragment_by_container);
        rebuilt.push(child);
    }
    node.children = Children::from_vec(rebuilt);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Indentation carries the nesting depth; a raw literal keeps it intact.
    const ACTIVITY_TOP: &str = r#"TASK com.example.app id=42 userId=0
  ACTIVITY com.example.app/.MainActivity 77aa88 pid=12345
    View Hierarchy:
      com.android.internal.policy.DecorView{e845a93 V.E...... R.....ID 0,0-1080,2400}
        android.widget.LinearLayout{5a2bcd0 V.E...... ......ID 0,0-1080,2400}
          android.widget.FrameLayout{77ccdd1 V.E...... ......ID 0,100-1080,2300 #7f0800c5 app:id/fragment_container}
            com.example.app.widget.AccentButton{1234abc VFED..C.. ......I. 40,2000-1040,2150 #7f0900a1 app:id/login}
    Added Fragments:
      #0: LoginFragment{9abc12 (fafafa) id=0x7f0800c5}
"#;

    fn node(attrs: &[(&str, &str)], children: Vec<HierarchyNode>) -> HierarchyNode {
        HierarchyNode {
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children: Children::from_vec(children),
        }
    }

    #[test]
    fn view_lines_parse_with_absolute_bounds() {
        let tree = parse_view_tree(ACTIVITY_TOP);
        assert_eq!(tree.views.len(), 4);
        let container = &tree.views[2];
        assert_eq!(container.bounds, "[0,100][1080,2300]");
        let button = &tree.views[3];
        assert_eq!(button.class, "com.example.app.widget.AccentButton");
        assert_eq!(button.resource_id.as_deref(), Some("app:id/login"));
        // 0,100 container origin plus 40,2000 relative.
        assert_eq!(button.bounds, "[40,2100][1040,2250]");
    }

    #[test]
    fn fragments_parse_with_container_ids() {
        let tree = parse_view_tree(ACTIVITY_TOP);
        assert_eq!(tree.fragments.len(), 1);
        assert_eq!(tree.fragments[0].name, "LoginFragment");
        assert_eq!(
            tree.fragments[0].container_id_hex.as_deref(),
            Some("7f0800c5")
        );
    }

    #[test]
    fn framework_class_is_upgraded_to_app_subclass() {
        let tree = parse_view_tree(ACTIVITY_TOP);
        let mut root = node(
            &[
                ("class", "android.widget.Button"),
                ("resource-id", "com.example.app:id/login"),
                ("clickable", "true"),
            ],
            vec![],
        );
        enrich_tree(&mut root, &tree);
        assert_eq!(
            root.attr("class"),
            Some("com.example.app.widget.AccentButton")
        );
    }

    #[test]
    fn framework_replacement_class_is_ignored() {
        let tree = ViewTree {
            views: vec![ViewInfo {
                class: "androidx.appcompat.widget.AppCompatButton".to_string(),
                id_hex: None,
                resource_id: Some("app:id/login".to_string()),
                bounds: "[0,0][100,50]".to_string(),
            }],
            fragments: Vec::new(),
        };
        let mut root = node(
            &[
                ("class", "android.widget.Button"),
                ("resource-id", "com.example.app:id/login"),
            ],
            vec![],
        );
        enrich_tree(&mut root, &tree);
        assert_eq!(root.attr("class"), Some("android.widget.Button"));
    }

    #[test]
    fn bounds_match_when_resource_id_is_absent() {
        let tree = parse_view_tree(ACTIVITY_TOP);
        let mut root = node(
            &[("class", "android.view.View"), ("bounds", "[40,2100][1040,2250]"), ("clickable", "true")],
            vec![],
        );
        enrich_tree(&mut root, &tree);
        assert_eq!(
            root.attr("class"),
            Some("com.example.app.widget.AccentButton")
        );
    }

    #[test]
    fn fragment_attribute_attaches_by_container_id() {
        let tree = parse_view_tree(ACTIVITY_TOP);
        let mut root = node(
            &[
                ("resource-id", "com.example.app:id/fragment_container"),
                ("clickable", "true"),
            ],
            vec![],
        );
        enrich_tree(&mut root, &tree);
        assert_eq!(root.attr("fragment"), Some("LoginFragment"));
    }

    #[test]
    fn empty_view_tree_leaves_nodes_untouched() {
        let mut root = node(&[("class", "android.widget.Button")], vec![]);
        let before = root.clone();
        enrich_tree(&mut root, &ViewTree::default());
        assert_eq!(root, before);
    }
}
