use crate::monitor::{Phase, ProgressEvent};
#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    pub is_interactive: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            is_interactive: std::io::stderr().is_terminal(),
        }
    }
}

impl ProgressConfig {
    pub fn auto_detect() -> Self {
        if is_ci_environment() {
            Self {
                enabled: true,
                is_interactive: false,
            }
        } else {
            Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            is_interactive: false,
        }
    }
}

/// Renders progress events on the terminal
pub struct BackupProgress {
    config: ProgressConfig,
    last_percent: Option<u8>,
    #[cfg(feature = "progress")]
    progress_bar: Option<ProgressBar>,
}

impl BackupProgress {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            last_percent: None,
            #[cfg(feature = "progress")]
            progress_bar: None,
        }
    }

    pub fn handle(&mut self, event: &ProgressEvent) {
        if !self.config.enabled {
            return;
        }

        #[cfg(feature = "progress")]
        {
            if self.config.is_interactive {
                self.render_bar(event);
                return;
            }
        }

        self.render_line(event);
    }

    pub fn finish(&mut self) {
        #[cfg(feature = "progress")]
        {
            if let Some(pb) = self.progress_bar.take() {
                pb.finish_and_clear();
            }
        }
    }

    #[cfg(feature = "progress")]
    fn render_bar(&mut self, event: &ProgressEvent) {
        let pb = self.progress_bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg:<22} [{bar:32.cyan/blue}] {pos:>3}%")
            {
                pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
            }
            pb
        });

        pb.set_message(phase_label(event.phase));
        pb.set_position(u64::from(event.percent()));
    }

    fn render_line(&mut self, event: &ProgressEvent) {
        let percent = event.percent();
        if event.phase == Phase::Estimating {
            eprintln!("{}", phase_label(event.phase));
            return;
        }
        if self.last_percent == Some(percent) && event.phase == Phase::Copying {
            return;
        }
        self.last_percent = Some(percent);
        eprintln!("{} {}%", phase_label(event.phase), percent);
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Estimating => "Calculating size...",
        Phase::Copying => "Copying...",
        Phase::Complete => "Copying complete!",
    }
}

/// Check if we're running in a CI environment
fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
        || std::env::var("JENKINS_URL").is_ok()
}
