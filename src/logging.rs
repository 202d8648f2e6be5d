// src/logging.rs
//
// Timestamped log lines to stderr, mirrored into a per-session log file once
// file logging is started.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const LATEST_LINK: &str = "serial-link.log";

struct LogSink {
    file: File,
    path: PathBuf,
}

static SINK: Mutex<Option<LogSink>> = Mutex::new(None);

fn timestamp() -> impl fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one line. Used by `tlog!`; file write errors are dropped so logging
/// can never fail the caller.
pub(crate) fn emit(args: fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), args);
    eprintln!("{}", line);

    let mut sink = SINK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(sink) = sink.as_mut() {
        let _ = writeln!(sink.file, "{}", line);
    }
}

/// Start mirroring log lines into a new `YYYYMMDD-HHMMSS-serial-link.log` in
/// `log_dir`. On Unix, `serial-link.log` is pointed at the newest file.
/// Returns the path of the file being written.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create log dir: {}", e))?;

    let file_name = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-serial-link.log")
        .to_string();
    let path = log_dir.join(&file_name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    #[cfg(unix)]
    {
        if let Err(e) = link_latest(log_dir, &file_name) {
            emit(format_args!(
                "[logging] Failed to update {}: {}",
                LATEST_LINK, e
            ));
        }
    }

    let previous = SINK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(LogSink {
            file,
            path: path.clone(),
        });
    if let Some(previous) = previous {
        emit(format_args!(
            "[logging] Switched from {}",
            previous.path.display()
        ));
    }
    emit(format_args!("[logging] File logging started: {}", path.display()));

    Ok(path)
}

/// Repoint the `serial-link.log` symlink. Windows is skipped because
/// symlinks need elevated privileges there.
#[cfg(unix)]
fn link_latest(log_dir: &Path, file_name: &str) -> std::io::Result<()> {
    let link = log_dir.join(LATEST_LINK);
    match std::fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(file_name, link)
}

/// Stop mirroring into the log file and close it.
pub fn stop_file_logging() {
    let closed = SINK.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sink) = closed {
        emit(format_args!(
            "[logging] File logging stopped: {}",
            sink.path.display()
        ));
    }
}

/// Log a line prefixed with `HH:MM:SS.mmm` local time.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_file_logging(dir.path()).unwrap();
        tlog!("[test] hello {}", 42);
        stop_file_logging();
        tlog!("[test] after stop");

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-serial-link.log"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[test] hello 42"));
        assert!(!content.contains("[test] after stop"));

        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(dir.path().join(LATEST_LINK)).unwrap(),
            PathBuf::from(name)
        );
    }
}
