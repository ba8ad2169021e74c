use std::io::IsTerminal;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber. The filter defaults to `info` and can
/// be overridden through `RUST_LOG`.
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|error| InitError::Subscriber(error.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

pub const CASE_LOG_SCHEMA_VERSION: &str = "ka-arena.case-log.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Pass,
    Fail,
    Error,
}

/// One JSON-lines record per evaluated test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub case_id: String,
    pub op_type: String,
    pub place: String,
    pub alias: String,
    pub outcome: CaseOutcome,
    pub reason_code: String,
    pub outputs_compared: usize,
    pub mismatch_count: usize,
    pub duration_us: u64,
}

impl StructuredCaseLog {
    #[must_use]
    pub fn new(
        case_id: &str,
        op_type: &str,
        place: String,
        alias: &str,
        outcome: CaseOutcome,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION.to_string(),
            case_id: case_id.to_string(),
            op_type: op_type.to_string(),
            place,
            alias: alias.to_string(),
            outcome,
            reason_code: reason_code.to_string(),
            outputs_compared: 0,
            mismatch_count: 0,
            duration_us: 0,
        }
    }

    #[must_use]
    pub fn with_counts(mut self, outputs_compared: usize, mismatch_count: usize) -> Self {
        self.outputs_compared = outputs_compared;
        self.mismatch_count = mismatch_count;
        self
    }

    #[must_use]
    pub fn with_duration_us(mut self, duration_us: u64) -> Self {
        self.duration_us = duration_us;
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
