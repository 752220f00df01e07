//! Crash reports for panics that escape the event loop.
//!
//! Panics inside handler tasks and reply callbacks are caught by the loop
//! and logged as task failures; everything else gets a report appended to
//! `crash.log` in the data directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::PathBuf;

use crate::config::Config;
use crate::executor::{self, panic_is_contained};

/// Install the panic hook. Call early in main().
///
/// Replaces the default hook: the report printed here already carries the
/// message, location and backtrace.
pub fn install() {
    panic::set_hook(Box::new(|info| {
        if panic_is_contained() {
            return;
        }
        handle_panic(info, &mut io::stderr(), crash_report_path());
    }));
}

fn crash_report_path() -> Option<PathBuf> {
    Config::data_dir().ok().map(|dir| dir.join("crash.log"))
}

fn handle_panic(info: &PanicHookInfo, out: &mut dyn Write, log: Option<PathBuf>) {
    let report = format_crash_report(info);
    let _ = writeln!(out, "{}", report);

    let Some(path) = log else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = file.write_all(b"\n");
        let _ = file.write_all(report.as_bytes());
        let _ = file.flush();
        let _ = writeln!(out, "Crash report appended to: {}", path.display());
    }
}

fn format_crash_report(info: &PanicHookInfo) -> String {
    let thread = std::thread::current();
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        "busloop {} crashed at {}\nthread:   {} ({:?})\nlocation: {}\nmessage:  {}\n\n{}\n",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        thread.name().unwrap_or("<unnamed>"),
        thread.id(),
        location,
        executor::panic_message(info.payload()),
        std::backtrace::Backtrace::force_capture(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_crash_report_lives_in_data_dir() {
        if let (Some(path), Ok(data)) = (crash_report_path(), Config::data_dir()) {
            assert!(path.starts_with(data));
            assert!(path.ends_with("crash.log"));
        }
    }

    #[test]
    fn test_report_is_printed_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("crash.log");
        let captured = Arc::new(Mutex::new(Vec::new()));

        let (sink, path) = (captured.clone(), log.clone());
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut out = sink.lock().unwrap();
            handle_panic(info, &mut *out, Some(path.clone()));
        }));
        let _ = panic::catch_unwind(|| panic!("disk on fire"));
        panic::set_hook(previous);

        let printed = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        assert_eq!(printed.matches("disk on fire").count(), 1);
        assert!(printed.contains("Crash report appended to"));
        assert!(fs::read_to_string(&log).unwrap().contains("disk on fire"));
    }
}
