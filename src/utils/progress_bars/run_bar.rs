// src/utils/progress_bars/run_bar.rs
use indicatif::{ProgressBar, ProgressStyle};

use crate::models::stats_models::RunProgress;

pub fn run_progress_bar(total: usize, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {prefix} {bar:40.cyan/blue} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb
}

pub fn progress_message(progress: &RunProgress) -> String {
    format!(
        "improved {} | auto {} | failed batches {} | ${:.4}",
        progress.improved, progress.auto_matched, progress.failed_batches, progress.cost_so_far
    )
}

/// Mirrors a polled snapshot onto the bar.
pub fn sync_bar(pb: &ProgressBar, progress: &RunProgress) {
    pb.set_length(progress.total as u64);
    pb.set_position(progress.processed as u64);
    pb.set_message(progress_message(progress));
}
