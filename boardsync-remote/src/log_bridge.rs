/// Logger setup for the `boardsync` binary.
///
/// Records go to stderr through env_logger. Once the config is loaded the
/// same records are also appended to the configured log file.
use chrono::{DateTime, SecondsFormat, Utc};
use env_logger::Logger;
use log::{Log, Metadata, Record, SetLoggerError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

struct FileSink {
    path: PathBuf,
    out: Mutex<LineWriter<File>>,
}

struct ClientLogger {
    console: Logger,
    file: OnceLock<FileSink>,
}

/// Handle to the installed logger.
#[derive(Clone, Copy)]
pub struct LogHandle(&'static ClientLogger);

impl ClientLogger {
    fn new(console: Logger) -> Self {
        Self {
            console,
            file: OnceLock::new(),
        }
    }

    fn attach_file(&self, path: &Path) -> io::Result<()> {
        if let Some(sink) = self.file.get() {
            return Err(already_logging(sink));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let sink = FileSink {
            path: path.to_path_buf(),
            out: Mutex::new(LineWriter::new(file)),
        };
        self.file.set(sink).map_err(|sink| already_logging(&sink))
    }
}

fn already_logging(sink: &FileSink) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("already logging to {}", sink.path.display()),
    )
}

fn format_record(at: DateTime<Utc>, record: &Record<'_>) -> String {
    format!(
        "{} {:<5} {} {}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        record.level(),
        record.target(),
        record.args().to_string().replace('\n', "\\n")
    )
}

impl Log for ClientLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.console.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.console.log(record);

        if let Some(sink) = self.file.get() {
            if let Ok(mut out) = sink.out.lock() {
                let _ = writeln!(out, "{}", format_record(Utc::now(), record));
            }
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(sink) = self.file.get() {
            if let Ok(mut out) = sink.out.lock() {
                let _ = out.flush();
            }
        }
    }
}

impl LogHandle {
    /// Start mirroring records into `path`. Only the first call takes effect.
    pub fn attach_file(self, path: &Path) -> io::Result<()> {
        self.0.attach_file(path)
    }
}

/// Install the logger. `RUST_LOG` overrides the default `warn` filter.
pub fn init() -> Result<LogHandle, SetLoggerError> {
    let console =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).build();
    let max_level = console.filter();
    let logger: &'static ClientLogger = Box::leak(Box::new(ClientLogger::new(console)));
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(LogHandle(logger))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use log::Level;
    use tempfile::TempDir;

    fn logger() -> ClientLogger {
        ClientLogger::new(env_logger::Builder::new().parse_filters("info").build())
    }

    #[test]
    fn test_record_format_is_single_line() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let line = format_record(
            at,
            &Record::builder()
                .level(Level::Warn)
                .target("boardsync.controller")
                .args(format_args!("first\nsecond"))
                .build(),
        );
        assert_eq!(
            line,
            "2023-11-14T22:13:20.000Z WARN  boardsync.controller first\\nsecond"
        );
    }

    #[test]
    fn test_records_are_mirrored_after_attach() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("client.log");
        let logger = logger();

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("boardsync.test")
                .args(format_args!("before attach"))
                .build(),
        );
        logger.attach_file(&path).unwrap();
        for (level, message) in [(Level::Info, "kept"), (Level::Debug, "filtered")] {
            logger.log(
                &Record::builder()
                    .level(level)
                    .target("boardsync.test")
                    .args(format_args!("{}", message))
                    .build(),
            );
        }
        logger.flush();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("INFO  boardsync.test kept"));
    }

    #[test]
    fn test_second_attach_is_refused() {
        let dir = TempDir::new().unwrap();
        let logger = logger();
        logger.attach_file(&dir.path().join("a.log")).unwrap();

        let err = logger.attach_file(&dir.path().join("b.log")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(!dir.path().join("b.log").exists());
        assert_eq!(
            logger.file.get().map(|sink| sink.path.clone()),
            Some(dir.path().join("a.log"))
        );
    }
}
