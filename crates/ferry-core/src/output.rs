//! Operator-facing output
//!
//! Importers and the orchestrator write through these sinks instead of
//! printing directly, so the same code runs under the console, inside a
//! worker process and under test.

use parking_lot::Mutex;
use std::io::Write;

/// Line-oriented output channel
pub trait OutputSink: Send + Sync {
    /// Write an informational line
    fn write_line(&self, line: &str);

    /// Write a diagnostic line
    fn write_error(&self, line: &str);
}

/// Progress reporting channel
pub trait ProgressSink: Send + Sync {
    /// Begin a bar of `total` steps
    fn start(&self, total: u64);

    /// Advance the bar
    fn advance(&self, step: u64);

    /// Complete the bar
    fn finish(&self);
}

/// Writes to stdout and stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOutput;

impl OutputSink for ConsoleOutput {
    fn write_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }

    fn write_error(&self, line: &str) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{line}");
    }
}

const BAR_WIDTH: usize = 28;

#[derive(Debug, Default)]
struct BarState {
    total: u64,
    current: u64,
}

/// Text progress bar
///
/// Renders one `current/total [=====>    ] pct%` line per update. The worker
/// pool recognises this shape and drops it from multiplexed output.
#[derive(Debug, Default)]
pub struct ConsoleProgress {
    state: Mutex<BarState>,
}

impl ConsoleProgress {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn render(state: &BarState) -> String {
        render_bar(state.current, state.total)
    }
}

impl ProgressSink for ConsoleProgress {
    fn start(&self, total: u64) {
        let mut state = self.state.lock();
        *state = BarState { total, current: 0 };
        println!("{}", Self::render(&state));
    }

    fn advance(&self, step: u64) {
        let mut state = self.state.lock();
        state.current = (state.current + step).min(state.total);
        println!("{}", Self::render(&state));
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.current = state.total;
        println!("{}", Self::render(&state));
    }
}

/// Discards progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn start(&self, _total: u64) {}
    fn advance(&self, _step: u64) {}
    fn finish(&self) {}
}

/// Render a progress line: `current/total [====>   ] pct%`
#[must_use]
pub fn render_bar(current: u64, total: u64) -> String {
    let pct = if total == 0 {
        100
    } else {
        current.saturating_mul(100) / total
    };
    #[allow(clippy::cast_possible_truncation)]
    let filled = (pct as usize * BAR_WIDTH) / 100;
    let mut bar = "=".repeat(filled);
    if filled < BAR_WIDTH {
        bar.push('>');
        bar.push_str(&" ".repeat(BAR_WIDTH - filled - 1));
    }
    format!("{current}/{total} [{bar}] {pct}%")
}

/// Render a box-drawing table
///
/// Column widths fit the widest cell; numeric-looking cells are right aligned.
#[must_use]
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let border = |left: &str, mid: &str, right: &str| {
        let segments: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{left}{}{right}", segments.join(mid))
    };
    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| {
                if !cell.is_empty() && cell.chars().all(|c| c.is_ascii_digit()) {
                    format!(" {cell:>w$} ")
                } else {
                    format!(" {cell:<w$} ")
                }
            })
            .collect();
        format!("│{}│", padded.join("│"))
    };

    let mut out = Vec::with_capacity(rows.len() + 4);
    out.push(border("┌", "┬", "┐"));
    out.push(line(headers.to_vec()));
    out.push(border("├", "┼", "┤"));
    for row in rows {
        let cells: Vec<&str> = (0..widths.len())
            .map(|i| row.get(i).map_or("", String::as_str))
            .collect();
        out.push(line(cells));
    }
    out.push(border("└", "┴", "┘"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_shape() {
        assert_eq!(
            render_bar(0, 4),
            format!("0/4 [>{}] 0%", " ".repeat(BAR_WIDTH - 1))
        );
        assert_eq!(render_bar(4, 4), format!("4/4 [{}] 100%", "=".repeat(BAR_WIDTH)));
        assert!(render_bar(1, 2).ends_with("] 50%"));
    }

    #[test]
    fn empty_total_is_complete() {
        assert!(render_bar(0, 0).ends_with("100%"));
    }

    #[test]
    fn table_layout() {
        let lines = render_table(
            &["Entity", "Migrated"],
            &[vec!["users".into(), "120".into()], vec!["orders".into(), "7".into()]],
        );
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "┌────────┬──────────┐");
        assert_eq!(lines[1], "│ Entity │ Migrated │");
        assert_eq!(lines[3], "│ users  │      120 │");
        assert_eq!(lines[5], "└────────┴──────────┘");
    }
}
