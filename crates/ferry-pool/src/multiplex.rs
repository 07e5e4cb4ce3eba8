//! Worker output multiplexing
//!
//! Interleaves the output of concurrent workers into one stream. Each line is
//! tagged with the worker's chunk offset and color; progress bars are dropped
//! and result tables pass through untouched so they stay aligned.

use crate::launcher::StreamKind;
use ferry_core::OutputSink;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

const PALETTE: [&str; 6] = [
    "\x1b[36m", // cyan
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[35m", // magenta
    "\x1b[34m", // blue
    "\x1b[96m", // bright cyan
];

static PROGRESS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\d+\s*/\s*\d+\s*\[[^\]]*\]\s*\d+(\.\d+)?\s*%").expect("progress pattern is valid")
});

/// How a worker line is forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// `N/M [====>   ] P%`, dropped
    Progress,
    /// Box-drawing table border or row, forwarded verbatim
    Table,
    /// Whitespace only, dropped
    Blank,
    /// Anything else, forwarded with a worker prefix
    Plain,
}

/// Classify one output line
#[must_use]
pub fn classify(line: &str) -> LineClass {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        LineClass::Blank
    } else if PROGRESS_LINE.is_match(trimmed) {
        LineClass::Progress
    } else if is_table_line(trimmed) {
        LineClass::Table
    } else {
        LineClass::Plain
    }
}

fn is_table_line(trimmed: &str) -> bool {
    match trimmed.chars().next() {
        Some(c) if ('\u{2500}'..='\u{257F}').contains(&c) => true,
        Some('+') => trimmed[1..].starts_with('-'),
        Some('|') => true,
        _ => false,
    }
}

/// Last segment of a carriage-return redrawn line
fn visible_segment(line: &str) -> &str {
    line.rsplit('\r').find(|s| !s.trim().is_empty()).unwrap_or("")
}

/// Palette slot held by a live worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(usize);

impl Color {
    #[inline]
    #[must_use]
    pub fn code(self) -> &'static str {
        PALETTE[self.0 % PALETTE.len()]
    }
}

/// Round-robin color allocation
///
/// Prefers colors no live worker holds. With more workers than colors, the
/// least shared color is reused.
#[derive(Debug)]
pub struct ColorPalette {
    holders: [usize; PALETTE.len()],
    cursor: usize,
}

impl Default for ColorPalette {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorPalette {
    #[must_use]
    pub fn new() -> Self {
        Self {
            holders: [0; PALETTE.len()],
            cursor: 0,
        }
    }

    pub fn acquire(&mut self) -> Color {
        let len = PALETTE.len();
        let slot = (0..len)
            .map(|i| (self.cursor + i) % len)
            .min_by_key(|&i| self.holders[i])
            .unwrap_or(0);
        self.holders[slot] += 1;
        self.cursor = (slot + 1) % len;
        Color(slot)
    }

    pub fn release(&mut self, color: Color) {
        let held = &mut self.holders[color.0 % PALETTE.len()];
        *held = held.saturating_sub(1);
    }

    /// Number of live holders of `color`
    #[must_use]
    pub fn holders(&self, color: Color) -> usize {
        self.holders[color.0 % PALETTE.len()]
    }
}

/// Writes worker lines to a shared sink
pub struct OutputMultiplexer {
    sink: Arc<dyn OutputSink>,
    palette: ColorPalette,
    colored: bool,
}

impl std::fmt::Debug for OutputMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMultiplexer")
            .field("palette", &self.palette)
            .field("colored", &self.colored)
            .finish_non_exhaustive()
    }
}

impl OutputMultiplexer {
    /// Colored multiplexer over `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            palette: ColorPalette::new(),
            colored: true,
        }
    }

    /// Enable or disable ANSI colors
    #[must_use]
    pub fn with_colors(mut self, colored: bool) -> Self {
        self.colored = colored;
        self
    }

    #[inline]
    #[must_use]
    pub fn sink(&self) -> &dyn OutputSink {
        self.sink.as_ref()
    }

    pub fn acquire_color(&mut self) -> Color {
        self.palette.acquire()
    }

    pub fn release_color(&mut self, color: Color) {
        self.palette.release(color);
    }

    /// Forward one worker line, returning whether anything was written
    pub fn emit(&self, offset: u64, color: Color, stream: StreamKind, line: &str) -> bool {
        let line = visible_segment(line);
        match classify(line) {
            LineClass::Progress | LineClass::Blank => false,
            LineClass::Table => {
                self.sink.write_line(line);
                true
            }
            LineClass::Plain => {
                let tag = self.tag(offset, color, stream);
                match stream {
                    StreamKind::Stdout => self.sink.write_line(&format!("{tag} {line}")),
                    StreamKind::Stderr => self.sink.write_error(&format!("{tag} {line}")),
                }
                true
            }
        }
    }

    /// Scheduler notice about a worker, such as a retry
    pub fn notice(&self, offset: u64, color: Color, message: &str) {
        let tag = self.tag(offset, color, StreamKind::Stdout);
        self.sink.write_line(&format!("{tag} {message}"));
    }

    fn tag(&self, offset: u64, color: Color, stream: StreamKind) -> String {
        let label = match stream {
            StreamKind::Stdout => format!("[Worker {offset}]"),
            StreamKind::Stderr => format!("[Worker {offset} ERROR]"),
        };
        if !self.colored {
            return label;
        }
        match stream {
            StreamKind::Stdout => format!("{}{label}{RESET}", color.code()),
            StreamKind::Stderr => format!("{BOLD}{}{label}{RESET}", color.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Capture {
        lines: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl OutputSink for Capture {
        fn write_line(&self, line: &str) {
            self.lines.lock().push(line.to_string());
        }

        fn write_error(&self, line: &str) {
            self.errors.lock().push(line.to_string());
        }
    }

    #[test]
    fn classifies_progress_bars() {
        assert_eq!(classify("50/100 [==============>       ] 50%"), LineClass::Progress);
        assert_eq!(classify("  3/4 [] 75%"), LineClass::Progress);
        assert_eq!(classify(&ferry_core::render_bar(7, 10)), LineClass::Progress);
        assert_eq!(classify("Migrating users..."), LineClass::Plain);
        assert_eq!(classify("50% done"), LineClass::Plain);
    }

    #[test]
    fn classifies_tables() {
        assert_eq!(classify("┌────────┬──────┐"), LineClass::Table);
        assert_eq!(classify("│ users  │  100 │"), LineClass::Table);
        assert_eq!(classify("+--------+------+"), LineClass::Table);
        assert_eq!(classify("+1 more"), LineClass::Plain);
        assert_eq!(classify("   "), LineClass::Blank);
    }

    #[test]
    fn carriage_return_redraws_keep_last_segment() {
        assert_eq!(visible_segment("1/4 [>] 25%\r2/4 [=>] 50%"), "2/4 [=>] 50%");
        assert_eq!(visible_segment("done\r"), "done");
    }

    #[test]
    fn palette_prefers_free_colors() {
        let mut palette = ColorPalette::new();
        let colors: Vec<Color> = (0..PALETTE.len()).map(|_| palette.acquire()).collect();
        for color in &colors {
            assert_eq!(palette.holders(*color), 1);
        }

        palette.release(colors[2]);
        assert_eq!(palette.acquire(), colors[2]);
    }

    #[test]
    fn emits_prefixed_lines_without_colors() {
        let sink = Arc::new(Capture::default());
        let mut mux = OutputMultiplexer::new(Arc::clone(&sink) as Arc<dyn OutputSink>).with_colors(false);
        let color = mux.acquire_color();

        assert!(mux.emit(200, color, StreamKind::Stdout, "Migrating users..."));
        assert!(mux.emit(200, color, StreamKind::Stderr, "row 212 rejected"));
        assert!(!mux.emit(200, color, StreamKind::Stdout, "10/50 [=====>   ] 20%"));
        assert!(mux.emit(200, color, StreamKind::Stdout, "└───┘"));

        assert_eq!(
            *sink.lines.lock(),
            vec!["[Worker 200] Migrating users...".to_string(), "└───┘".to_string()]
        );
        assert_eq!(*sink.errors.lock(), vec!["[Worker 200 ERROR] row 212 rejected".to_string()]);
    }

    #[test]
    fn colored_tags_reset_after_label() {
        let sink = Arc::new(Capture::default());
        let mut mux = OutputMultiplexer::new(Arc::clone(&sink) as Arc<dyn OutputSink>);
        let color = mux.acquire_color();
        mux.emit(0, color, StreamKind::Stdout, "hello");

        let line = sink.lines.lock()[0].clone();
        assert!(line.starts_with(color.code()));
        assert!(line.ends_with(&format!("[Worker 0]{RESET} hello")));
    }

    #[test]
    fn error_tags_keep_worker_color() {
        let sink = Arc::new(Capture::default());
        let mut mux = OutputMultiplexer::new(Arc::clone(&sink) as Arc<dyn OutputSink>);
        let first = mux.acquire_color();
        let second = mux.acquire_color();
        mux.emit(0, first, StreamKind::Stderr, "boom");
        mux.emit(100, second, StreamKind::Stderr, "boom");

        let errors = sink.errors.lock().clone();
        assert_eq!(errors[0], format!("{BOLD}{}[Worker 0 ERROR]{RESET} boom", first.code()));
        assert_eq!(errors[1], format!("{BOLD}{}[Worker 100 ERROR]{RESET} boom", second.code()));
        assert_ne!(first.code(), second.code());
    }
}
