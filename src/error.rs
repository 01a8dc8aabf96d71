//! Error types shared across the crate.
use crate::key::OmKey;
use crate::trigger::{TriggerKey, TriggerQuery};
use thiserror::Error;

/// Failure to resolve a [`TriggerQuery`] against the detector status.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LookupError {
    #[error("no trigger status matches {0}")]
    NoMatch(TriggerQuery),
    #[error("{query} matches {} trigger statuses", matches.len())]
    AmbiguousMatch {
        query: TriggerQuery,
        matches: Vec<TriggerKey>,
    },
}

/// Error configuring a trigger algorithm from its status.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("setting `{name}` is missing")]
    MissingSetting { name: String },
    #[error("setting `{name}` has invalid value `{value}`")]
    InvalidSetting { name: String, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

/// Fatal conditions while turning PMT pulses into launches.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LauncherError {
    #[error("pulses found on {0} which is not a configured DOM")]
    UnknownDom(OmKey),
    #[error("{dom} has invalid PMT high voltage {voltage}")]
    InvalidHighVoltage { dom: OmKey, voltage: f64 },
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum NnlsError {
    #[error("right-hand side has {got} rows, matrix has {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("solution did not converge within {0} iterations")]
    IterationLimit(usize),
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum WavedeformError {
    #[error("no calibration for {0}")]
    MissingCalibration(OmKey),
    #[error("unfolding waveforms of {dom}: {source}")]
    Unfold { dom: OmKey, source: NnlsError },
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum GlobalTriggerError {
    #[error("no readout window for {0} and no default readout configured")]
    NoReadoutWindow(TriggerKey),
}

/// Crate-level error returned by [`World`](crate::World).
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Launcher(#[from] LauncherError),
    #[error(transparent)]
    Wavedeform(#[from] WavedeformError),
    #[error(transparent)]
    GlobalTrigger(#[from] GlobalTriggerError),
}
