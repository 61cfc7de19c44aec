//! Session configuration.
//!
//! A [`SessionConfig`] says which counters to resolve, which backend resolves
//! them, and where and how results are written. It can be deserialized with
//! serde or read from the `PDUMP_*` environment variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `PDUMP_EVENTS` | list of counter names | |
//! | `PDUMP_CODES` | list of numeric counter codes, used when `PDUMP_EVENTS` is unset | |
//! | `PDUMP_DELIMITER` | list separator (first character) | `,` |
//! | `PDUMP_DUMP_DIR` | output directory | `.` |
//! | `PDUMP_FILENAME` | output base name | `perf_dump` |
//! | `PDUMP_OUTPUT_FORMAT` | `csv` for the delimited log, anything else for the array store | array |
//! | `PDUMP_BACKEND` | `procstat` or `perf` | `procstat` |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Which counters a backend should try to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSelector {
    /// Counters by name.
    Names(Vec<String>),
    /// Counters by numeric code (position in the backend's catalog).
    Codes(Vec<u32>),
}

impl EventSelector {
    /// Returns `true` when nothing was requested.
    pub fn is_empty(&self) -> bool {
        match self {
            EventSelector::Names(names) => names.is_empty(),
            EventSelector::Codes(codes) => codes.is_empty(),
        }
    }
}

/// Physical layout of the shared artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Flat `rank,region,metric,value` text log.
    Csv,
    /// Extensible array store, one group per region.
    #[default]
    Array,
}

impl OutputFormat {
    /// Parses `PDUMP_OUTPUT_FORMAT`: `csv` in any case selects the delimited
    /// log, everything else the array store.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("csv") {
            OutputFormat::Csv
        } else {
            OutputFormat::Array
        }
    }
}

/// Counter backend implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Per-thread process statistics from `/proc`.
    #[default]
    ProcStat,
    /// Linux `perf_event_open` counters (feature `perf`).
    Perf,
}

impl BackendKind {
    /// Parses `PDUMP_BACKEND`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "procstat" | "proc" => Ok(BackendKind::ProcStat),
            "perf" => Ok(BackendKind::Perf),
            other => Err(Error::Config(format!("unknown counter backend {:?}", other))),
        }
    }
}

/// Everything a session needs to know before `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Counters to resolve.
    pub events: EventSelector,

    /// Directory the artifact is written to.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// Artifact base name, without extension.
    #[serde(default = "default_filename")]
    pub filename: String,

    /// Artifact layout.
    #[serde(default)]
    pub format: OutputFormat,

    /// Counter backend.
    #[serde(default)]
    pub backend: BackendKind,
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_filename() -> String {
    "perf_dump".into()
}

impl SessionConfig {
    /// Creates a configuration with default output settings.
    pub fn new(events: EventSelector) -> Self {
        Self {
            events,
            dump_dir: default_dump_dir(),
            filename: default_filename(),
            format: OutputFormat::default(),
            backend: BackendKind::default(),
        }
    }

    /// Sets the output directory.
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    /// Sets the artifact base name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the artifact layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the counter backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let separator = lookup("PDUMP_DELIMITER")
            .and_then(|d| d.chars().next())
            .unwrap_or(',');

        let events = if let Some(names) = get("PDUMP_EVENTS") {
            EventSelector::Names(split_list(&names, separator).map(str::to_string).collect())
        } else if let Some(codes) = get("PDUMP_CODES") {
            let codes = split_list(&codes, separator)
                .filter_map(|code| match code.trim().parse::<u32>() {
                    Ok(code) => Some(code),
                    Err(_) => {
                        warn!(code, "ignoring malformed counter code");
                        None
                    }
                })
                .collect();
            EventSelector::Codes(codes)
        } else {
            return Err(Error::Config(
                "neither PDUMP_EVENTS nor PDUMP_CODES is set".to_string(),
            ));
        };

        let mut config = SessionConfig::new(events);
        if let Some(dir) = get("PDUMP_DUMP_DIR") {
            config.dump_dir = PathBuf::from(dir);
        }
        if let Some(filename) = get("PDUMP_FILENAME") {
            config.filename = filename;
        }
        if let Some(format) = lookup("PDUMP_OUTPUT_FORMAT") {
            config.format = OutputFormat::parse(&format);
        }
        if let Some(backend) = get("PDUMP_BACKEND") {
            config.backend = BackendKind::parse(&backend)?;
        }
        Ok(config)
    }

    /// Path of the artifact for a group of `peer_count` peers.
    ///
    /// The array store's dataset shape depends on the group size, so its
    /// file name carries the peer count; the delimited log does not.
    pub fn output_path(&self, peer_count: usize) -> PathBuf {
        let name = match self.format {
            OutputFormat::Csv => format!("{}.csv", self.filename),
            OutputFormat::Array => format!("{}.{}.pda", self.filename, peer_count),
        };
        self.dump_dir.join(name)
    }

    /// Directory the artifact is written to.
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }
}

/// Splits a delimited list, dropping empty items (a trailing separator is
/// allowed).
fn split_list(list: &str, separator: char) -> impl Iterator<Item = &str> {
    list.split(separator).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_events_by_name() {
        let config =
            SessionConfig::from_lookup(lookup(&[("PDUMP_EVENTS", "MINFLT,UTIME,")])).unwrap();
        assert_eq!(
            config.events,
            EventSelector::Names(vec!["MINFLT".to_string(), "UTIME".to_string()])
        );
        assert_eq!(config.format, OutputFormat::Array);
        assert_eq!(config.backend, BackendKind::ProcStat);
    }

    #[test]
    fn test_custom_delimiter() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PDUMP_EVENTS", "a;b;c"),
            ("PDUMP_DELIMITER", ";"),
        ]))
        .unwrap();
        assert_eq!(
            config.events,
            EventSelector::Names(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_codes_used_when_events_empty() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PDUMP_EVENTS", ""),
            ("PDUMP_CODES", "0,2,x,5"),
        ]))
        .unwrap();
        assert_eq!(config.events, EventSelector::Codes(vec![0, 2, 5]));
    }

    #[test]
    fn test_missing_events_is_error() {
        let err = SessionConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_output_paths() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PDUMP_EVENTS", "MINFLT"),
            ("PDUMP_DUMP_DIR", "/scratch/run"),
            ("PDUMP_FILENAME", "bench"),
            ("PDUMP_OUTPUT_FORMAT", "CSV"),
        ]))
        .unwrap();
        assert_eq!(config.output_path(4), PathBuf::from("/scratch/run/bench.csv"));

        let config = config.with_format(OutputFormat::Array);
        assert_eq!(config.output_path(4), PathBuf::from("/scratch/run/bench.4.pda"));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("csv"), OutputFormat::Csv);
        assert_eq!(OutputFormat::parse("Csv"), OutputFormat::Csv);
        assert_eq!(OutputFormat::parse("hdf5"), OutputFormat::Array);
        assert_eq!(OutputFormat::parse(""), OutputFormat::Array);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(BackendKind::parse("PERF").unwrap(), BackendKind::Perf);
        assert_eq!(BackendKind::parse("procstat").unwrap(), BackendKind::ProcStat);
        assert!(BackendKind::parse("papi").is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{"events":{"names":["MINFLT"]},"format":"csv"}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.events, EventSelector::Names(vec!["MINFLT".into()]));
        assert_eq!(config.format, OutputFormat::Csv);
        assert_eq!(config.filename, "perf_dump");
        assert_eq!(config.dump_dir, PathBuf::from("."));
    }
}
