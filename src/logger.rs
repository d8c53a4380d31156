//! Terminal logging with colored module prefixes.
//!
//! - `log!` prints `[module] message` with a colored prefix
//! - `debug!` prints only when verbose mode is on
//! - `BuildStatus` overwrites its previous output in watch mode
//! - `ProgressLine` renders in-place counters for bulk builds

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{Write, stdout},
    sync::LazyLock,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Global verbose flag, set from `EngineConfig::verbose`.
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enable or disable `debug!` output.
pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

/// Check if verbose mode is enabled.
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Lines of progress display currently on screen (for log coordination).
static PROGRESS_LINES: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// Macros
// ============================================================================

/// Log a message with a colored module prefix.
///
/// # Usage
/// ```ignore
/// log!("build"; "queued {} pages", count);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (shown only in verbose mode).
///
/// # Usage
/// ```ignore
/// debug!("scheduler"; "dispatching {}", page);
/// ```
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

// ============================================================================
// Core
// ============================================================================

/// Write one prefixed line, stepping around any active progress display.
#[inline]
#[allow(clippy::cast_possible_truncation)] // progress line count is always small
pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);

    let mut stdout = stdout().lock();

    let progress = PROGRESS_LINES.load(Ordering::SeqCst);
    if progress > 0 {
        execute!(stdout, cursor::MoveUp(progress as u16)).ok();
        execute!(stdout, Clear(ClearType::FromCursorDown)).ok();
    } else {
        execute!(stdout, Clear(ClearType::UntilNewLine)).ok();
    }

    writeln!(stdout, "{prefix} {message}").ok();

    for _ in 0..progress {
        writeln!(stdout).ok();
    }

    stdout.flush().ok();
}

fn colorize_prefix(module: &str) -> String {
    let prefix = format!("[{module}]");
    match module {
        "render" | "reload" => prefix.bright_blue().bold().to_string(),
        "watch" => prefix.bright_green().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

// ============================================================================
// Build Status (single-block status with overwrite)
// ============================================================================

/// Current time as HH:MM:SS (UTC, display only).
fn now() -> String {
    use std::time::SystemTime;
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{:02}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60)
}

/// Watch-mode status display that overwrites its previous block, so repeated
/// rebuild messages do not scroll the terminal.
pub struct BuildStatus {
    /// Lines of previous output to clear.
    last_lines: usize,
}

/// Shared status block: build, watch and reload phases overwrite each other
/// instead of stacking stale messages.
static BUILD_STATUS: LazyLock<Mutex<BuildStatus>> =
    LazyLock::new(|| Mutex::new(BuildStatus::new()));

impl BuildStatus {
    pub const fn new() -> Self {
        Self { last_lines: 0 }
    }

    /// Success message (green check).
    pub fn success(&mut self, message: &str) {
        self.display(&format!("{}", "✓".green()), message);
    }

    /// Error message (red cross) with optional multi-line detail.
    pub fn error(&mut self, summary: &str, detail: &str) {
        let message = if detail.is_empty() {
            summary.to_string()
        } else {
            format!("{summary}\n{detail}")
        };
        self.display(&format!("{}", "✗".red()), &message);
    }

    /// Warning message (yellow marker).
    pub fn warning(&mut self, detail: &str) {
        self.display(&format!("{}", "⚠".yellow()), detail);
    }

    /// Overwrite the previous block with a timestamped message.
    fn display(&mut self, symbol: &str, message: &str) {
        let mut stdout = stdout().lock();

        if self.last_lines > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let lines = self.last_lines as u16;
            execute!(stdout, cursor::MoveUp(lines)).ok();
            execute!(stdout, Clear(ClearType::FromCursorDown)).ok();
        }

        let timestamp = format!("[{}]", now()).dimmed().to_string();
        writeln!(stdout, "{timestamp} {symbol} {message}").ok();
        stdout.flush().ok();

        self.last_lines = message.matches('\n').count() + 1;
    }
}

/// Shared status block: success.
pub fn status_success(message: &str) {
    BUILD_STATUS.lock().success(message);
}

/// Shared status block: error.
pub fn status_error(summary: &str, detail: &str) {
    BUILD_STATUS.lock().error(summary, detail);
}

/// Shared status block: warning.
pub fn status_warning(detail: &str) {
    BUILD_STATUS.lock().warning(detail);
}

// ============================================================================
// Progress Line
// ============================================================================

/// Single-line progress counters, updated in place.
///
/// Displays: `[build] pages(12/40) errors(1/40)`. Uses `try_lock` so worker
/// tasks never block on the display; a skipped refresh is caught by the next
/// increment.
pub struct ProgressLine {
    counters: Vec<Counter>,
    lock: Mutex<()>,
}

struct Counter {
    name: &'static str,
    total: usize,
    current: AtomicUsize,
}

impl ProgressLine {
    /// Create a progress line; counters with a zero total are omitted.
    pub fn new(items: &[(&'static str, usize)]) -> Self {
        let counters: Vec<_> = items
            .iter()
            .filter(|(_, total)| *total > 0)
            .map(|&(name, total)| Counter {
                name,
                total,
                current: AtomicUsize::new(0),
            })
            .collect();

        PROGRESS_LINES.store(1, Ordering::SeqCst);

        let progress = Self {
            counters,
            lock: Mutex::new(()),
        };
        progress.render(false);
        progress
    }

    /// Increment the named counter and refresh the line if it is free.
    #[inline]
    pub fn inc(&self, name: &str) {
        for counter in &self.counters {
            if counter.name == name {
                counter.current.fetch_add(1, Ordering::Relaxed);
                if self.lock.try_lock().is_some() {
                    self.render(false);
                }
                return;
            }
        }
    }

    fn render(&self, finished: bool) {
        let line = self
            .counters
            .iter()
            .map(|c| {
                let current = c.current.load(Ordering::Relaxed);
                format!("{}({}/{})", c.name, current, c.total)
            })
            .collect::<Vec<_>>()
            .join(" ");

        let mut stdout = stdout().lock();
        execute!(
            stdout,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine)
        )
        .ok();
        if finished {
            writeln!(stdout, "{} {}", colorize_prefix("build"), line).ok();
        } else {
            write!(stdout, "{} {}", colorize_prefix("build"), line).ok();
        }
        stdout.flush().ok();
    }

    /// Final render with a newline so the line survives in scrollback.
    pub fn finish(self) {
        PROGRESS_LINES.store(0, Ordering::SeqCst);
        {
            let _guard = self.lock.lock(); // wait out any pending refresh
            self.render(true);
        }
        std::mem::forget(self); // Drop would clear the finished line
    }
}

impl Drop for ProgressLine {
    fn drop(&mut self) {
        PROGRESS_LINES.store(0, Ordering::SeqCst);

        // Dropped without finish(): clear the dangling line.
        let mut stdout = stdout().lock();
        execute!(
            stdout,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine)
        )
        .ok();
        stdout.flush().ok();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_new() {
        let status = BuildStatus::new();
        assert_eq!(status.last_lines, 0);
    }

    #[test]
    fn test_status_line_count_single() {
        let message = "rebuilt: pages/index.html";
        assert_eq!(message.matches('\n').count() + 1, 1);
    }

    #[test]
    fn test_status_line_count_error_with_detail() {
        let summary = "build failed: pages/index.html";
        let detail = "compile failed:\nunexpected token\n  --> index.html:3:1";
        let message = format!("{summary}\n{detail}");
        assert_eq!(message.matches('\n').count() + 1, 4);
    }

    #[test]
    fn test_progress_line_skips_zero_totals() {
        let progress = ProgressLine::new(&[("pages", 3), ("errors", 0)]);
        assert_eq!(progress.counters.len(), 1);
        progress.finish();
    }
}
