use crate::hierarchy::parse::parse_bounds;
use crate::models::{Children, HierarchyNode};

const SCORE_ATTR: &str = "accessibility-score";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Rect {
    fn from_bounds(bounds: &str) -> Option<Self> {
        let (left, top, right, bottom) = parse_bounds(bounds)?;
        let rect = Rect {
            left: left as i64,
            top: top as i64,
            right: right as i64,
            bottom: bottom as i64,
        };
        (rect.right > rect.left && rect.bottom > rect.top).then_some(rect)
    }

    fn area(&self) -> i64 {
        (self.right - self.left) * (self.bottom - self.top)
    }

    fn intersect(&self, other: &Rect) -> Option<Rect> {
        let rect = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        (rect.right > rect.left && rect.bottom > rect.top).then_some(rect)
    }
}

/// Annotates every clickable node with the fraction of its area left visible
/// once later-stacked rectangles are subtracted. Document order stands in
/// for z-order: a node later in the dump draws above an earlier one. Nodes
/// whose bounds do not parse are left untouched.
pub fn annotate_scores(root: &mut HierarchyNode) {
    let mut rects: Vec<(usize, Rect)> = Vec::new();
    let mut index = 0usize;
    collect_rects(root, &mut index, &mut rects);

    let mut index = 0usize;
    annotate(root, &mut index, &rects);
}

fn collect_rects(node: &HierarchyNode, index: &mut usize, out: &mut Vec<(usize, Rect)>) {
    if let Some(rect) = node.attr("bounds").and_then(Rect::from_bounds) {
        out.push((*index, rect));
    }
    *index += 1;
    for child in node.children.iter() {
        collect_rects(child, index, out);
    }
}

fn annotate(node: &mut HierarchyNode, index: &mut usize, rects: &[(usize, Rect)]) {
    let my_index = *index;
    *index += 1;

    if node.attr("clickable") == Some("true") {
        if let Some(rect) = node.attr("bounds").and_then(Rect::from_bounds) {
            let score = visible_fraction(my_index, rect, rects);
            node.set_attr(SCORE_ATTR, format!("{score:.3}"));
        }
    }

    // Children come after the parent in document order, so a mutable
    // traversal in the same preorder keeps the indices aligned.
    let children = std::mem::take(&mut node.children).into_vec();
    let mut rebuilt = Vec::with_capacity(children.len());
    for mut child in children {
        annotate(&mut child, index, rects);
        rebuilt.push(child);
    }
    node.children = Children::from_vec(rebuilt);
}

fn visible_fraction(node_index: usize, rect: Rect, rects: &[(usize, Rect)]) -> f64 {
    let overlaps: Vec<Rect> = rects
        .iter()
        .filter(|(other_index, _)| *other_index > node_index)
        .filter_map(|(_, other)| rect.intersect(other))
        .collect();

    let area = rect.area();
    let covered = union_area(&overlaps);
    let fraction = (area - covered) as f64 / area as f64;
    (fraction * 1000.0).round() / 1000.0
}

/// Exact union area by coordinate compression. Overlap sets are tiny here
/// (occluders of a single node), so the grid sweep is cheap.
fn union_area(rects: &[Rect]) -> i64 {
    if rects.is_empty() {
        return 0;
    }
    let mut xs: Vec<i64> = rects.iter().flat_map(|r| [r.left, r.right]).collect();
    let mut ys: Vec<i64> = rects.iter().flat_map(|r| [r.top, r.bottom]).collect();
    xs.sort_unstable();
    xs.dedup();
    ys.sort_unstable();
    ys.dedup();

    let mut total = 0i64;
    for window_x in xs.windows(2) {
        for window_y in ys.windows(2) {
            let covered = rects.iter().any(|r| {
                r.left <= window_x[0]
                    && r.right >= window_x[1]
                    && r.top <= window_y[0]
                    && r.bottom >= window_y[1]
            });
            if covered {
                total += (window_x[1] - window_x[0]) * (window_y[1] - window_y[0]);
            }
        }
    }
    total
}
