use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};
use watchpost::{StreamState, StreamStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: &str) -> Self {
        match flag {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Stderr presentation for the binaries. Logging goes through `log` regardless.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: &str, stderr_is_tty: bool) -> Self {
        let pretty = stderr_is_tty
            && match UiMode::parse(ui_flag) {
                UiMode::Plain => false,
                UiMode::Auto | UiMode::Pretty => true,
            };
        Self { pretty }
    }

    /// Marks a startup step; finishes with its elapsed time when dropped.
    pub fn stage(&self, name: &str) -> Stage {
        let spinner = self.pretty.then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {name}");
        }
        Stage {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
        }
    }

    /// One line per camera: state, frames and the last error if any.
    pub fn camera_summary(&self, streams: &[StreamStats]) {
        let width = streams.iter().map(|s| s.camera.len()).max().unwrap_or(0);
        for stream in streams {
            let marker = match (self.pretty, stream.state) {
                (true, StreamState::Streaming) => "●",
                (true, StreamState::Failed) => "✖",
                (true, _) => "○",
                (false, _) => "-",
            };
            let mut line = format!(
                "{marker} {:<width$}  {:<12} frames={} dropped={} reconnects={}",
                stream.camera,
                stream.state.to_string(),
                stream.frames_captured,
                stream.frames_dropped,
                stream.reconnects,
            );
            if stream.state == StreamState::Failed {
                if let Some(err) = &stream.last_error {
                    line.push_str(&format!("  ({err})"));
                }
            }
            eprintln!("{line}");
        }
    }
}

pub struct Stage {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for Stage {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
