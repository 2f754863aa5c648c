//! Runtime configuration of a reactive network.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, ReactiveResult};

/// Options recognised by [`crate::network::ReactiveNetwork`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactiveConfig {
    /// Write every pull and packet to a trace file.
    pub trace_inference: bool,
    /// Directory for trace files. Required when `trace_inference` is set.
    pub trace_dir: Option<PathBuf>,
    /// How long wiring calls wait for both blocks to acknowledge.
    pub wiring_timeout_ms: u64,
    /// How long [`crate::reactive::AnswerStream::next_answer`] waits.
    pub answer_timeout_ms: u64,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            trace_inference: false,
            trace_dir: None,
            wiring_timeout_ms: 5_000,
            answer_timeout_ms: 10_000,
        }
    }
}

impl ReactiveConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ReactiveResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Enable tracing into `dir`.
    #[must_use]
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_inference = true;
        self.trace_dir = Some(dir.into());
        self
    }

    /// Check option combinations.
    pub fn validate(&self) -> ReactiveResult<()> {
        if self.trace_inference && self.trace_dir.is_none() {
            return Err(invalid("trace_inference requires trace_dir"));
        }
        if self.wiring_timeout_ms == 0 {
            return Err(invalid("wiring_timeout_ms must be positive"));
        }
        if self.answer_timeout_ms == 0 {
            return Err(invalid("answer_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// [`Self::wiring_timeout_ms`] as a duration.
    #[must_use]
    pub const fn wiring_timeout(&self) -> Duration {
        Duration::from_millis(self.wiring_timeout_ms)
    }

    /// [`Self::answer_timeout_ms`] as a duration.
    #[must_use]
    pub const fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

fn invalid(reason: &str) -> ReactiveError {
    ReactiveError::InvalidConfig {
        reason: reason.to_string(),
    }
}
