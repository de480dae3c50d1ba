use regex::Regex;

/// Packages that never count as the foreground app when scanning window
/// blocks.
const SYSTEM_WINDOW_PACKAGES: &[&str] = &[
    "com.android.systemui",
    "com.google.android.apps.nexuslauncher",
    "com.android.launcher",
    "com.sec.android.app.launcher",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBlock {
    pub handle: String,
    pub title: String,
    pub body: String,
}

/// Splits a `dumpsys window` dump into per-window blocks. A block runs from
/// its `Window #N Window{handle uX title}` header to the next header.
pub fn split_window_blocks(dump: &str) -> Vec<WindowBlock> {
    let Ok(header_re) = Regex::new(r"(?m)^\s*Window #\d+ Window\{(\S+) u\d+ ([^}]+)\}") else {
        return Vec::new();
    };

    let mut blocks = Vec::new();
    let matches: Vec<_> = header_re.captures_iter(dump).collect();
    for (index, caps) in matches.iter().enumerate() {
        let start = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let end = matches
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(dump.len());
        blocks.push(WindowBlock {
            handle: caps[1].to_string(),
            title: caps[2].trim().to_string(),
            body: dump[start..end].to_string(),
        });
    }
    blocks
}

fn split_component(title: &str) -> Option<(String, String)> {
    let (package, activity) = title.split_once('/')?;
    if package.is_empty() || activity.is_empty() {
        return None;
    }
    Some((package.to_string(), activity.to_string()))
}

fn is_system_window(package: &str) -> bool {
    SYSTEM_WINDOW_PACKAGES
        .iter()
        .any(|known| package == *known || package.starts_with(known))
}

fn activity_record_component(body: &str) -> Option<(String, String)> {
    let re = Regex::new(r"ActivityRecord\{\S+ u\d+ ([^\s/}]+)/([^\s}]+)").ok()?;
    let caps = re.captures(body)?;
    let activity = caps[2].trim_end_matches(|c: char| c == '}').to_string();
    // Trailing task token ("t123") shows up as a separate word, so the
    // capture above stops at whitespace already.
    Some((caps[1].to_string(), activity))
}

/// Resolves the foreground package/activity through the four-tier fallback
/// chain: ime-control-target line, pop-up handle indirection, first visible
/// non-system window, then any base-application window.
pub fn parse_foreground(dump: &str) -> Option<(String, String)> {
    let ime_re = Regex::new(r"imeControlTarget[^\n]*?Window\{(\S+) u\d+ ([^}]+)\}").ok()?;

    let mut popup_handle: Option<String> = None;
    if let Some(caps) = ime_re.captures(dump) {
        let title = caps[2].trim();
        if let Some(component) = split_component(title) {
            return Some(component);
        }
        if title.starts_with("PopupWindow") {
            popup_handle = Some(caps[1].to_string());
        }
    }

    let blocks = split_window_blocks(dump);

    if let Some(handle) = popup_handle {
        if let Some(block) = blocks.iter().find(|block| block.handle == handle) {
            if let Some(component) = activity_record_component(&block.body) {
                return Some(component);
            }
        }
    }

    for block in &blocks {
        let Some((package, activity)) = split_component(&block.title) else {
            continue;
        };
        if block.body.contains("isOnScreen=true")
            && block.body.contains("isVisible=true")
            && !is_system_window(&package)
        {
            return Some((package, activity));
        }
    }

    for block in &blocks {
        if block.body.contains("ty=BASE_APPLICATION") {
            if let Some(component) = split_component(&block.title) {
                return Some(component);
            }
        }
    }

    None
}

/// Running total of every `mLayoutSeq=` counter in the dump. Non-numeric
/// values are skipped, not treated as zero.
pub fn sum_layout_seq(dump: &str) -> u64 {
    let Ok(re) = Regex::new(r"mLayoutSeq=(\S+)") else {
        return 0;
    };
    re.captures_iter(dump)
        .filter_map(|caps| caps[1].parse::<u64>().ok())
        .fold(0u64, |acc, value| acc.saturating_add(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DUMP: &str = "\
WINDOW MANAGER WINDOWS (dumpsys window windows)\n\
  Window #0 Window{1a2b3c u0 StatusBar}\n\
    mDisplayId=0 rootTaskId=1 mSession=Session{aa 512:u0a10144}\n\
    mAttrs={(0,0)(fillxfill) sim={} ty=NOTIFICATION_SHADE fmt=TRANSLUCENT}\n\
    isOnScreen=true\n\
    isVisible=true\n\
    mLayoutSeq=204\n\
  Window #1 Window{9f8e7d u0 com.android.systemui/com.android.systemui.ImageWallpaper}\n\
    isOnScreen=true\n\
    isVisible=true\n\
    mLayoutSeq=abc\n\
  Window #2 Window{4d5e6f u0 com.example.app/com.example.app.MainActivity}\n\
    mAttrs={(0,0)(fillxfill) sim={} ty=BASE_APPLICATION fmt=OPAQUE}\n\
    mActivityRecord=ActivityRecord{77aa88 u0 com.example.app/.MainActivity t42}\n\
    isOnScreen=true\n\
    isVisible=true\n\
    mLayoutSeq=317\n";

    #[test]
    fn tier_one_reads_ime_control_target() {
        let dump = format!(
            "  imeControlTarget in display# 0 Window{{4d5e6f u0 com.example.app/com.example.app.MainActivity}}\n{FULL_DUMP}"
        );
        let (package, activity) = parse_foreground(&dump).expect("component");
        assert_eq!(package, "com.example.app");
        assert_eq!(activity, "com.example.app.MainActivity");
    }

    #[test]
    fn tier_two_follows_popup_handle_to_activity_record() {
        let dump = "\
  imeControlTarget in display# 0 Window{beef01 u0 PopupWindow:7a3f2b}\n\
  Window #0 Window{beef01 u0 PopupWindow:7a3f2b}\n\
    mActivityRecord=ActivityRecord{77aa88 u0 com.example.app/.ComposeActivity t42}\n\
    isOnScreen=true\n\
    isVisible=true\n";
        let (package, activity) = parse_foreground(dump).expect("component");
        assert_eq!(package, "com.example.app");
        assert_eq!(activity, ".ComposeActivity");
    }

    #[test]
    fn tier_three_skips_system_windows() {
        let (package, activity) = parse_foreground(FULL_DUMP).expect("component");
        assert_eq!(package, "com.example.app");
        assert_eq!(activity, "com.example.app.MainActivity");
    }

    #[test]
    fn tier_four_falls_back_to_base_application_type() {
        let dump = "\
  Window #0 Window{4d5e6f u0 com.example.app/com.example.app.MainActivity}\n\
    mAttrs={(0,0)(fillxfill) ty=BASE_APPLICATION fmt=OPAQUE}\n\
    isOnScreen=false\n\
    isVisible=false\n";
        let (package, _) = parse_foreground(dump).expect("component");
        assert_eq!(package, "com.example.app");
    }

    #[test]
    fn unresolvable_dump_yields_none() {
        assert_eq!(parse_foreground("nothing to see here"), None);
    }

    #[test]
    fn layout_seq_sums_numeric_and_skips_garbage() {
        assert_eq!(sum_layout_seq(FULL_DUMP), 204 + 317);
    }

    #[test]
    fn splits_blocks_with_handles_and_titles() {
        let blocks = split_window_blocks(FULL_DUMP);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].handle, "1a2b3c");
        assert_eq!(blocks[0].title, "StatusBar");
        assert!(blocks[2].body.contains("BASE_APPLICATION"));
    }
}
