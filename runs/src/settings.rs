//! Run-layer configuration.
//!
//! Raw TOML deserialization happens through a private struct with defaults;
//! the public [`RunSettings`] only exists in validated form, resolved at the
//! parse boundary.

use std::num::NonZeroUsize;

use serde::Deserialize;

use crate::RunId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunSettingsError {
    #[error("thread_name_prefix must not be empty")]
    EmptyThreadNamePrefix,
}

fn default_thread_name_prefix() -> String {
    "run".to_string()
}

#[derive(Deserialize)]
struct RawRunSettings {
    #[serde(default = "default_thread_name_prefix")]
    thread_name_prefix: String,
    #[serde(default)]
    max_live_runs: Option<NonZeroUsize>,
}

/// Validated run-layer settings.
///
/// Invariant: `thread_name_prefix` is non-empty (enforced via
/// `#[serde(try_from)]` at the deserialization boundary).
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRunSettings")]
pub struct RunSettings {
    thread_name_prefix: String,
    max_live_runs: Option<NonZeroUsize>,
}

impl TryFrom<RawRunSettings> for RunSettings {
    type Error = RunSettingsError;

    fn try_from(raw: RawRunSettings) -> Result<Self, Self::Error> {
        if raw.thread_name_prefix.trim().is_empty() {
            return Err(RunSettingsError::EmptyThreadNamePrefix);
        }
        Ok(Self {
            thread_name_prefix: raw.thread_name_prefix,
            max_live_runs: raw.max_live_runs,
        })
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_name_prefix(),
            max_live_runs: None,
        }
    }
}

impl RunSettings {
    #[must_use]
    pub fn thread_name_prefix(&self) -> &str {
        &self.thread_name_prefix
    }

    /// Cap on concurrently tracked runs; `None` means unlimited.
    #[must_use]
    pub fn max_live_runs(&self) -> Option<NonZeroUsize> {
        self.max_live_runs
    }

    /// Name given to the OS thread backing a run, e.g. `run-3`.
    #[must_use]
    pub fn thread_name(&self, id: RunId) -> String {
        format!("{}-{}", self.thread_name_prefix, id)
    }
}
