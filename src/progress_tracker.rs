use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str =
    "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// Progress bar shared by dataset encoding and inference loops.
pub(crate) fn progress_bar(len: usize, message: impl Into<String>) -> ProgressBar {
    let progress_bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
        progress_bar.set_style(style.progress_chars("#>-"));
    }
    progress_bar.set_message(message.into());
    progress_bar
}
