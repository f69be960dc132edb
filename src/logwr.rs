//! Buffered line log writer.
//!
//! The runtime itself traces through the `log` facade; this writer is
//! the sink side of the contract: it accumulates formatted lines in a
//! block-aligned buffer, filters by a severity mask and flushes
//! complete lines to a file target or standard error. The internal
//! mutex serializes writers because the target may be shared with
//! other processes even though the loop itself is single-threaded.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Buffer capacity is kept aligned to this block size.
const CAPA_ALIGN: usize = 512;

/// Severity selection mask.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LogMask(u32);

impl LogMask {
    pub const ERROR: LogMask = LogMask(1 << 0);
    pub const WARN: LogMask = LogMask(1 << 1);
    pub const INFO: LogMask = LogMask(1 << 2);
    pub const DEBUG: LogMask = LogMask(1 << 3);
    pub const TRACE: LogMask = LogMask(1 << 4);
    pub const ALL: LogMask = LogMask(0x1f);

    pub const fn contains(self, other: LogMask) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for LogMask {
    type Output = LogMask;
    fn bitor(self, rhs: LogMask) -> LogMask {
        LogMask(self.0 | rhs.0)
    }
}

struct State {
    buf: String,
    max_capa: usize,
    target: Option<File>,
    target_path: Option<PathBuf>,
}

/// A buffered, mutex-guarded line writer.
pub struct LineWriter {
    state: Mutex<State>,
    mask: LogMask,
}

impl LineWriter {
    pub fn new() -> LineWriter {
        LineWriter {
            state: Mutex::new(State {
                buf: String::with_capacity(CAPA_ALIGN),
                max_capa: 0,
                target: None,
                target_path: None,
            }),
            mask: LogMask::ALL,
        }
    }

    pub fn mask(&self) -> LogMask {
        self.mask
    }

    pub fn set_mask(&mut self, mask: LogMask) {
        self.mask = mask;
    }

    /// Caps buffer growth; 0 means unlimited.
    pub fn set_max_capa(&mut self, max_capa: usize) {
        let mut state = self.state.lock().expect("log writer poisoned");
        state.max_capa = max_capa;
    }

    /// Redirects output to a file, appending. Passing a path replaces
    /// any previous target.
    pub fn set_target(&mut self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut state = self.state.lock().expect("log writer poisoned");
        state.target = Some(file);
        state.target_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn target_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().expect("log writer poisoned");
        state.target_path.clone()
    }

    /// Appends text to the line buffer, flushing each completed line.
    pub fn write_str(&self, severity: LogMask, text: &str) {
        if !self.mask.contains(severity) {
            return;
        }
        let mut state = self.state.lock().expect("log writer poisoned");
        for ch in text.chars() {
            state.buf.push(ch);
            if ch == '\n' {
                flush_line(&mut state);
            }
        }
        if state.max_capa > 0 && state.buf.len() >= state.max_capa {
            flush_line(&mut state);
        }
        // keep the capacity block-aligned as the buffer grows
        if state.buf.capacity() - state.buf.len() < CAPA_ALIGN / 2 {
            let grown = (state.buf.capacity() + 2 * CAPA_ALIGN - 1) & !(CAPA_ALIGN - 1);
            let additional = grown - state.buf.len();
            state.buf.reserve(additional);
        }
    }

    pub fn write_line(&self, severity: LogMask, line: &str) {
        self.write_str(severity, line);
        if !line.ends_with('\n') {
            self.write_str(severity, "\n");
        }
    }
}

impl Default for LineWriter {
    fn default() -> LineWriter {
        LineWriter::new()
    }
}

fn flush_line(state: &mut State) {
    if state.buf.is_empty() {
        return;
    }
    let out = std::mem::take(&mut state.buf);
    match &mut state.target {
        Some(file) => {
            let _ = file.write_all(out.as_bytes());
        }
        None => {
            let _ = io::stderr().write_all(out.as_bytes());
        }
    }
}

#[cfg(feature = "log")]
fn level_mask(level: log::Level) -> LogMask {
    match level {
        log::Level::Error => LogMask::ERROR,
        log::Level::Warn => LogMask::WARN,
        log::Level::Info => LogMask::INFO,
        log::Level::Debug => LogMask::DEBUG,
        log::Level::Trace => LogMask::TRACE,
    }
}

#[cfg(feature = "log")]
impl log::Log for LineWriter {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.mask.contains(level_mask(metadata.level()))
    }

    fn log(&self, record: &log::Record<'_>) {
        let severity = level_mask(record.level());
        if !self.mask.contains(severity) {
            return;
        }
        let now = crate::time::realtime_now();
        self.write_line(
            severity,
            &format!(
                "{}.{:03} {} {} {}",
                now.sec(),
                now.nsec() / 1_000_000,
                record.level(),
                record.target(),
                record.args()
            ),
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_filters() {
        let mut w = LineWriter::new();
        w.set_mask(LogMask::ERROR | LogMask::WARN);
        assert!(w.mask().contains(LogMask::ERROR));
        assert!(!w.mask().contains(LogMask::DEBUG));
    }

    #[test]
    fn writes_to_file_target() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("evio-logwr-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut w = LineWriter::new();
        w.set_target(&path).unwrap();
        w.write_line(LogMask::INFO, "hello line");
        w.write_str(LogMask::INFO, "partial");
        w.write_str(LogMask::INFO, " rest\n");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello line\n"));
        assert!(contents.contains("partial rest\n"));
        let _ = std::fs::remove_file(&path);
    }
}
