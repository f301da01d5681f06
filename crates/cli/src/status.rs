//! Cargo-style status output for confsync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!     Pulling am from localhost:50051...
//!      Pulled 42 files (118.25 KiB) in 310ms
//!    Watching /tmp/config -> am@localhost:50051 every 10s
//! ```

use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;

use tracing_subscriber::fmt::MakeWriter;

use confsync_core::UnpackSummary;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const PULLING: &str = "Pulling";
    const PULLED: &str = "Pulled";
    const WATCHING: &str = "Watching";
    const SCANNED: &str = "Scanned";
    const STOPPED: &str = "Stopped";
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Spinner currently drawn on stderr, if any
static ACTIVE_SPINNER: Mutex<Option<ProgressBar>> = Mutex::new(None);

fn active_spinner() -> Option<ProgressBar> {
    ACTIVE_SPINNER.lock().ok().and_then(|active| active.clone())
}

fn set_active_spinner(spinner: Option<ProgressBar>) {
    if let Ok(mut active) = ACTIVE_SPINNER.lock() {
        *active = spinner;
    }
}

/// Console log writer; hides the active spinner while a log line is written
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusWriter;

impl std::io::Write for StatusWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match active_spinner() {
            Some(spinner) => spinner.suspend(|| std::io::stderr().write(buf)),
            None => std::io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

/// Spinner registered with [`StatusWriter`]; cleared when dropped
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    fn start(message: &'static str, prefix: String) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) =
            indicatif::ProgressStyle::default_spinner().template("{spinner:.green} {msg:>12} {prefix}")
        {
            bar.set_style(style);
        }
        bar.set_message(message);
        bar.set_prefix(prefix);
        bar.enable_steady_tick(Duration::from_millis(80));
        set_active_spinner(Some(bar.clone()));
        Self { bar }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        set_active_spinner(None);
        self.bar.finish_and_clear();
    }
}

impl<'a> MakeWriter<'a> for StatusWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Status reporter for one command
pub struct Progress {
    start: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Spinner shown while waiting for the archive
    pub fn pull_spinner(&self, product: &str, server: &str) -> Spinner {
        Spinner::start(Status::PULLING, format!("{product} from {server}..."))
    }

    /// Show the pull summary
    pub fn pulled(&self, summary: &UnpackSummary) {
        let size = humansize::format_size(summary.bytes, humansize::BINARY);
        print_status(
            Status::PULLED,
            &format!(
                "{} files ({size}) in {}",
                summary.files,
                format_elapsed(self.start.elapsed())
            ),
        );
    }

    /// Show what the push loop is about to watch
    pub fn watching(&self, root: &Path, product: &str, server: &str, interval_secs: u64) {
        print_status(
            Status::WATCHING,
            &format!(
                "{} -> {product}@{server} every {interval_secs}s",
                root.display()
            ),
        );
    }

    /// Show the result of a local scan
    pub fn scanned(&self, files: usize, total_bytes: u64) {
        let size = humansize::format_size(total_bytes, humansize::BINARY);
        print_status(
            Status::SCANNED,
            &format!(
                "{files} files ({size}) in {}",
                format_elapsed(self.start.elapsed())
            ),
        );
    }

    /// Show that the push loop ended
    pub fn stopped(&self) {
        print_status(
            Status::STOPPED,
            &format!("after {}", format_elapsed(self.start.elapsed())),
        );
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
