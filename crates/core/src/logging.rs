//! Which tracing directives apply, and where the log file goes.

use std::fs;
use std::iter;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Dependencies of this crate that log every session build and provider
/// fallback at `info`.
const CHATTY_TARGETS: &[&str] = &["ort"];

const LOG_FILE_PREFIX: &str = "tilescale";
const MAX_LOG_FILES: usize = 14;

/// Where the user's filter came from, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    /// `--log-filter`
    Flag(String),
    /// `-v` or `-vv`
    Verbosity(u8),
    /// `RUST_LOG`
    Env(String),
    Builtin,
}

impl FilterSource {
    /// Blank strings count as unset.
    pub fn select(flag: Option<&str>, verbose: u8, env: Option<&str>) -> Self {
        let given = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        if let Some(flag) = given(flag) {
            Self::Flag(flag)
        } else if verbose > 0 {
            Self::Verbosity(verbose)
        } else if let Some(env) = given(env) {
            Self::Env(env)
        } else {
            Self::Builtin
        }
    }

    pub fn directives(&self) -> &str {
        match self {
            Self::Flag(filter) | Self::Env(filter) => filter.as_str(),
            Self::Verbosity(1) => "debug",
            Self::Verbosity(_) => "trace",
            Self::Builtin => DEFAULT_LOG_FILTER,
        }
    }

    /// Stderr directives. Chatty dependencies only get through with errors
    /// unless the filter came from `--log-filter` or `-v`.
    pub fn console_directives(&self) -> String {
        self.capped("error")
    }

    /// Log file directives; chatty dependencies keep their warnings.
    pub fn file_directives(&self) -> String {
        self.capped("warn")
    }

    fn capped(&self, level: &str) -> String {
        if matches!(self, Self::Flag(_) | Self::Verbosity(_)) {
            return self.directives().to_string();
        }
        CHATTY_TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .chain(iter::once(self.directives().to_string()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Destination of the file layer.
#[derive(Debug)]
pub enum LogFile {
    /// `tilescale.<date>.log` in `dir`, rotated daily.
    Daily {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly { reason: String },
}

impl LogFile {
    pub fn open(dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::ConsoleOnly {
                reason: "no data dir".to_string(),
            };
        };
        if let Err(error) = fs::create_dir_all(dir) {
            return Self::ConsoleOnly {
                reason: format!("cannot create {}: {error}", dir.display()),
            };
        }
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .max_log_files(MAX_LOG_FILES)
            .build(dir);
        match appender {
            Ok(appender) => Self::Daily {
                dir: dir.to_path_buf(),
                appender,
            },
            Err(error) => Self::ConsoleOnly {
                reason: format!("cannot open a log file in {}: {error}", dir.display()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_flag_beats_verbosity_beats_env() {
        assert_eq!(
            FilterSource::select(Some("tilescale_core=trace"), 2, Some("error")),
            FilterSource::Flag("tilescale_core=trace".to_string())
        );
        assert_eq!(FilterSource::select(None, 1, Some("warn")), FilterSource::Verbosity(1));
        assert_eq!(
            FilterSource::select(None, 0, Some("warn")),
            FilterSource::Env("warn".to_string())
        );
        assert_eq!(FilterSource::select(Some("  "), 0, Some("")), FilterSource::Builtin);
    }

    #[test]
    fn test_verbosity_directives() {
        assert_eq!(FilterSource::Verbosity(1).directives(), "debug");
        assert_eq!(FilterSource::Verbosity(3).directives(), "trace");
        assert_eq!(FilterSource::Verbosity(2).console_directives(), "trace");
    }

    #[test]
    fn test_chatty_targets_capped_per_sink() {
        assert_eq!(FilterSource::Builtin.console_directives(), "ort=error,info");
        assert_eq!(FilterSource::Builtin.file_directives(), "ort=warn,info");

        let env = FilterSource::Env("warn,tilescale_core=debug".to_string());
        assert_eq!(env.console_directives(), "ort=error,warn,tilescale_core=debug");
    }

    #[test]
    fn test_flag_is_used_verbatim() {
        let flag = FilterSource::Flag("ort=debug".to_string());
        assert_eq!(flag.console_directives(), "ort=debug");
        assert_eq!(flag.file_directives(), "ort=debug");
    }

    #[test]
    fn test_log_file_created_under_dir() {
        let data = tempdir().expect("tempdir");
        let dir = data.path().join("logs");
        match LogFile::open(Some(&dir)) {
            LogFile::Daily { dir: opened, .. } => {
                assert_eq!(opened, dir);
                assert!(dir.is_dir());
            }
            LogFile::ConsoleOnly { reason } => panic!("expected a log file: {reason}"),
        }
    }

    #[test]
    fn test_console_only_when_dir_is_unusable() {
        let file = NamedTempFile::new().expect("named temp file");
        match LogFile::open(Some(&file.path().join("logs"))) {
            LogFile::ConsoleOnly { reason } => assert!(reason.contains("cannot create"), "{reason}"),
            LogFile::Daily { .. } => panic!("a file cannot hold a log dir"),
        }
        assert!(matches!(LogFile::open(None), LogFile::ConsoleOnly { .. }));
    }
}
