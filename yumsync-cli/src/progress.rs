use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressState, ProgressStyle};
use yumsync_core::download::{DownloadState, ProgressFn};

const PREFIX_WIDTH: usize = 34;

pub fn create_progress_bar() -> ProgressBar {
    let progress_bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{prefix} [{wide_bar:.green/white}] {bytes_per_sec:14} {computed_bytes:22}",
    )
    .unwrap()
    .with_key("computed_bytes", format_bytes)
    .progress_chars("━━");
    progress_bar.set_style(style);
    progress_bar
}

fn format_bytes(state: &ProgressState, w: &mut dyn std::fmt::Write) {
    write!(
        w,
        "{}/{}",
        HumanBytes(state.pos()),
        HumanBytes(state.len().unwrap_or(state.pos()))
    )
    .unwrap();
}

/// Builds the progress callback handed to the engine: one bar per transfer,
/// keyed by the request label.
pub fn progress_callback() -> ProgressFn {
    let multi = MultiProgress::new();
    let bars: Mutex<HashMap<String, ProgressBar>> = Mutex::new(HashMap::new());

    Arc::new(move |label, state| {
        let mut bars = bars.lock().unwrap();
        match state {
            DownloadState::Preparing { total } => {
                let pb = multi.add(create_progress_bar());
                pb.set_length(total);

                let prefix = if label.len() > PREFIX_WIDTH {
                    format!("{:.width$}", label, width = PREFIX_WIDTH)
                } else {
                    format!("{:<width$}", label, width = PREFIX_WIDTH)
                };
                pb.set_prefix(prefix);
                bars.insert(label.to_string(), pb);
            }
            DownloadState::Progress { current, .. } => {
                if let Some(pb) = bars.get(label) {
                    pb.set_position(current);
                }
            }
            DownloadState::Complete => {
                if let Some(pb) = bars.remove(label) {
                    pb.finish();
                }
            }
            DownloadState::Failed => {
                if let Some(pb) = bars.remove(label) {
                    pb.abandon();
                }
            }
        }
    })
}
