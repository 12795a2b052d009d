//! Terminal configuration, persisted as JSON.
//!
//! Everything the embedder can tune without touching code: scrollback
//! depth, the word-character set for double-click selection, the `TERM`
//! value handed to children, an optional keytab file, and the silence
//! monitor timeout. All fields default sensibly so partial config files
//! load cleanly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HistoryType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Scrollback configuration for the primary screen.
    pub history: HistoryType,
    /// Characters that count as word constituents besides alphanumerics.
    pub word_characters: String,
    /// `TERM` value propagated to the child at spawn.
    pub term: String,
    /// Extra keytab file to load next to the built-in table.
    pub keytab: Option<PathBuf>,
    /// Quiet period before a session with silence monitoring fires.
    pub silence_timeout_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            history: HistoryType::Buffer { max_lines: 1000 },
            word_characters: ":@-./_~".into(),
            term: "xterm".into(),
            keytab: None,
            silence_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl TerminalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load, falling back to defaults when the file is absent or broken
    /// (the problem is logged, never fatal).
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{e}; using default terminal config");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = TerminalConfig::default();
        assert_eq!(config.history, HistoryType::Buffer { max_lines: 1000 });
        assert_eq!(config.word_characters, ":@-./_~");
        assert_eq!(config.term, "xterm");
        assert_eq!(config.silence_timeout_ms, 10_000);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        let config = TerminalConfig {
            history: HistoryType::Buffer { max_lines: 5000 },
            term: "xterm-color".into(),
            ..TerminalConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TerminalConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        std::fs::write(&path, r#"{"term": "vt100"}"#).unwrap();
        let config = TerminalConfig::load(&path).unwrap();
        assert_eq!(config.term, "vt100");
        assert_eq!(config.history, HistoryType::Buffer { max_lines: 1000 });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = TerminalConfig::load_or_default(Path::new("/no/such/config.json"));
        assert_eq!(config, TerminalConfig::default());
    }

    #[test]
    fn history_none_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminal.json");
        let config = TerminalConfig {
            history: HistoryType::None,
            ..TerminalConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(
            TerminalConfig::load(&path).unwrap().history,
            HistoryType::None
        );
    }
}
