use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::platform::{NativePlatform, Platform};

pub const LOG_LEVEL_ENV: &str = "OPTIAGENT_LOG";

/// Appends every log line to the data-dir log file and, in verbose mode,
/// mirrors it to stderr so it never mixes with command output on stdout.
#[derive(Clone)]
pub(crate) struct LogFileMakeWriter {
    file: Arc<Mutex<File>>,
    mirror_stderr: bool,
}

impl<'a> MakeWriter<'a> for LogFileMakeWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: self.file.clone(),
            mirror_stderr: self.mirror_stderr,
        }
    }
}

pub(crate) struct LogFileWriter {
    file: Arc<Mutex<File>>,
    mirror_stderr: bool,
}

impl std::io::Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            file.write_all(buf)?;
        }
        if self.mirror_stderr {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush()?;
        if self.mirror_stderr {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

pub(crate) fn parse_level(raw: Option<&str>) -> Level {
    raw.and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO)
}

/// Install the global subscriber. Safe to call once per process.
pub(crate) fn init(data_dir: &Path, verbose: bool) -> Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    NativePlatform::restrict_dir_permissions(&log_dir);

    let log_path = log_dir.join("optiagent.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    NativePlatform::restrict_file_permissions(&log_path);

    let level = parse_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
    let writer = LogFileMakeWriter {
        file: Arc::new(Mutex::new(file)),
        mirror_stderr: verbose,
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(parse_level(None), Level::INFO);
        assert_eq!(parse_level(Some("nonsense")), Level::INFO);
    }

    #[test]
    fn level_accepts_case_insensitive_names() {
        assert_eq!(parse_level(Some("debug")), Level::DEBUG);
        assert_eq!(parse_level(Some(" WARN ")), Level::WARN);
    }

    #[test]
    fn writer_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let make = LogFileMakeWriter {
            file: Arc::new(Mutex::new(file)),
            mirror_stderr: false,
        };
        make.make_writer().write_all(b"first\n").unwrap();
        make.make_writer().write_all(b"second\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
