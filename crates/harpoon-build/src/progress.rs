use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// `--silent-build` のときに出力の代わりに表示するスピナー
pub struct BuildProgress {
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(image: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Building {}...", image));
        pb.enable_steady_tick(Duration::from_millis(120));

        Self { progress_bar: pb }
    }

    /// 現在のステップを表示
    pub fn set_step(&self, line: &str) {
        let step = line.trim();
        if step.starts_with("Step ") {
            self.progress_bar.set_message(step.to_string());
        }
    }

    pub fn finish_success(&self, cached: bool) {
        let message = if cached {
            "Build completed ✓ (cached)"
        } else {
            "Build completed ✓"
        };
        self.progress_bar.finish_with_message(message);
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Build failed: {}", error));
    }
}

impl Drop for BuildProgress {
    fn drop(&mut self) {
        if !self.progress_bar.is_finished() {
            self.progress_bar.finish_and_clear();
        }
    }
}
