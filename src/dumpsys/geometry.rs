use regex::Regex;

use crate::models::{Insets, ScreenSize};

/// Extracts the `Physical size: WxH` line from the raw dump. Surrounding
/// noise is ignored; a dump without the line is a deterministic failure.
pub fn parse_physical_dimensions(dump: &str) -> Result<ScreenSize, String> {
    let re = Regex::new(r"Physical size:\s*(\d+)x(\d+)").map_err(|err| err.to_string())?;
    let caps = re
        .captures(dump)
        .ok_or_else(|| "No physical size line in dump".to_string())?;
    let width = caps[1]
        .parse::<i32>()
        .map_err(|_| "Invalid physical width".to_string())?;
    let height = caps[2]
        .parse::<i32>()
        .map_err(|_| "Invalid physical height".to_string())?;
    Ok(ScreenSize { width, height })
}

/// Surface rotation code 0..=3, from either the numeric or the symbolic
/// dumpsys form.
pub fn parse_rotation(dump: &str) -> Option<i32> {
    let re = Regex::new(r"m(?:Current)?Rotation=(?:ROTATION_)?(\d+)").ok()?;
    let caps = re.captures(dump)?;
    let value = caps[1].parse::<i32>().ok()?;
    match value {
        0 | 1 | 2 | 3 => Some(value),
        90 => Some(1),
        180 => Some(2),
        270 => Some(3),
        _ => None,
    }
}

/// Rotations 1 and 3 swap the axes; 0, 2 and anything outside 0..=3 are
/// identity.
pub fn adjust_for_rotation(size: ScreenSize, rotation: i32) -> ScreenSize {
    match rotation {
        1 | 3 => ScreenSize {
            width: size.height,
            height: size.width,
        },
        _ => size,
    }
}

/// Edge insets from `InsetsSource … frame=[l,t][r,b]` lines. Each bar is
/// assigned to the screen edge its frame hugs; sources with frames that do
/// not touch an edge are ignored.
pub fn parse_insets(dump: &str, size: ScreenSize) -> Insets {
    let Ok(re) = Regex::new(
        r"type=(statusBars|navigationBars)[^\n]*?frame=\[(\d+),(\d+)\]\[(\d+),(\d+)\]",
    ) else {
        return Insets::default();
    };

    let mut insets = Insets::default();
    for caps in re.captures_iter(dump) {
        let (left, top, right, bottom) = match (
            caps[2].parse::<i32>(),
            caps[3].parse::<i32>(),
            caps[4].parse::<i32>(),
            caps[5].parse::<i32>(),
        ) {
            (Ok(l), Ok(t), Ok(r), Ok(b)) => (l, t, r, b),
            _ => continue,
        };
        let width = right - left;
        let height = bottom - top;
        if width <= 0 || height <= 0 {
            continue;
        }
        if width >= height {
            // Horizontal bar: top edge or bottom edge.
            if top == 0 {
                insets.top = insets.top.max(bottom);
            } else if size.height > 0 && bottom >= size.height {
                insets.bottom = insets.bottom.max(size.height - top);
            }
        } else {
            // Vertical bar (rotated navigation): left or right edge.
            if left == 0 {
                insets.left = insets.left.max(right);
            } else if size.width > 0 && right >= size.width {
                insets.right = insets.right.max(size.width - left);
            }
        }
    }
    insets
}
