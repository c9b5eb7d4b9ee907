//! Terminal progress rendering on top of the core reporter interface.

use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};

use swiftget_core::progress::ProgressReporter;

const SIMPLE_TEMPLATE: &str = "{bar:30} {bytes}/{total_bytes} {msg}";
const DETAILED_TEMPLATE: &str = "{bar:40.cyan/blue} {bytes}/{total_bytes} ({percent}%) {msg}";
const UNSIZED_TEMPLATE: &str = "{spinner} {bytes} {msg}";

/// Indicatif-backed progress bar. Simple mode for single-stream transfers,
/// detailed mode for multi-connection ones.
pub struct ConsoleProgress {
    bar: ProgressBar,
    template: &'static str,
    sized: AtomicBool,
}

impl ConsoleProgress {
    pub fn new(detailed: bool) -> Self {
        let template = if detailed { DETAILED_TEMPLATE } else { SIMPLE_TEMPLATE };
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::with_template(UNSIZED_TEMPLATE).expect("static template"),
        );
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        Self {
            bar,
            template,
            sized: AtomicBool::new(false),
        }
    }
}

impl ProgressReporter for ConsoleProgress {
    fn update(&self, bytes_downloaded: u64, total_bytes: u64, speed_bps: f64) {
        if total_bytes > 0 && !self.sized.swap(true, Ordering::Relaxed) {
            self.bar.set_length(total_bytes);
            self.bar.set_style(
                ProgressStyle::with_template(self.template).expect("static template"),
            );
        }
        self.bar.set_position(bytes_downloaded);
        self.bar.set_message(format!("{:.2} MiB/s", speed_bps / 1_048_576.0));
    }

    fn complete(&self) {
        self.bar.finish_with_message("done");
    }
}
