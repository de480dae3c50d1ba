use regex::Regex;

use crate::models::{CounterSnapshot, StabilitySample};

/// Raw parse of `dumpsys gfxinfo <package>`. Fields stay optional here; the
/// stability detector decides what missing metrics mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GfxStats {
    pub missed_vsync: Option<u64>,
    pub slow_ui_thread: Option<u64>,
    pub frame_deadline_missed: Option<u64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl GfxStats {
    /// A usable sample needs p50/p90/p95 and all three counters. p99 stays
    /// optional; it is diagnostics only.
    pub fn into_sample(self) -> Option<StabilitySample> {
        Some(StabilitySample {
            counters: CounterSnapshot {
                missed_vsync: self.missed_vsync?,
                slow_ui_thread: self.slow_ui_thread?,
                frame_deadline_missed: self.frame_deadline_missed?,
            },
            p50_ms: self.p50_ms?,
            p90_ms: self.p90_ms?,
            p95_ms: self.p95_ms?,
            p99_ms: self.p99_ms,
        })
    }
}

fn capture_counter(re: &Regex, output: &str) -> Option<u64> {
    re.captures(output)?.get(1)?.as_str().parse::<u64>().ok()
}

fn capture_percentile(output: &str, which: &str) -> Option<f64> {
    let re = Regex::new(&format!(r"{which}th percentile:\s*([0-9.]+)ms")).ok()?;
    re.captures(output)?.get(1)?.as_str().parse::<f64>().ok()
}

pub fn parse_gfx_stats(output: &str) -> GfxStats {
    let missed_vsync_re = Regex::new(r"Number Missed Vsync:\s*(\d+)").ok();
    let slow_ui_re = Regex::new(r"Number Slow UI thread:\s*(\d+)").ok();
    let deadline_re = Regex::new(r"Number Frame deadline missed:\s*(\d+)").ok();

    GfxStats {
        missed_vsync: missed_vsync_re
            .as_ref()
            .and_then(|re| capture_counter(re, output)),
        slow_ui_thread: slow_ui_re
            .as_ref()
            .and_then(|re| capture_counter(re, output)),
        frame_deadline_missed: deadline_re
            .as_ref()
            .and_then(|re| capture_counter(re, output)),
        p50_ms: capture_percentile(output, "50"),
        p90_ms: capture_percentile(output, "90"),
        p95_ms: capture_percentile(output, "95"),
        p99_ms: capture_percentile(output, "99"),
    }
}
