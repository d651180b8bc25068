//! Definition of errors.

use core::fmt;

use alloc::string::String;

#[cfg(feature = "std")]
use std::error::Error;

/// Error used when the argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: &'static str,
}

/// Error used when a training sequence contradicts the transition model,
/// e.g. a label uses a state or transition the model declares structurally
/// invalid.
#[derive(Debug)]
pub struct ConfigError {
    msg: String,
    sequence: Option<usize>,
}

impl ConfigError {
    /// Index of the offending sequence within the batch, if the error is
    /// attributable to a single sequence.
    #[inline(always)]
    #[must_use]
    pub const fn sequence(&self) -> Option<usize> {
        self.sequence
    }
}

/// Error used when no legal path exists for a sequence.
#[derive(Debug)]
pub struct NoValidPathsError {
    position: usize,
}

impl NoValidPathsError {
    /// Position at which every state became unreachable.
    #[inline(always)]
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }
}

/// The error type for semicrf.
#[derive(Debug)]
pub enum SemiCrfError {
    /// The argument is invalid.
    InvalidArgument(InvalidArgumentError),

    /// A training sequence contradicts the transition model.
    Config(ConfigError),

    /// No legal path exists for a sequence.
    NoValidPaths(NoValidPathsError),
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConfigError: {}", self.msg)
    }
}

impl fmt::Display for NoValidPathsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NoValidPathsError: no valid paths at position {}",
            self.position
        )
    }
}

#[cfg(feature = "std")]
impl Error for InvalidArgumentError {}

#[cfg(feature = "std")]
impl Error for ConfigError {}

#[cfg(feature = "std")]
impl Error for NoValidPathsError {}

impl SemiCrfError {
    /// Creates a new [`InvalidArgumentError`].
    pub const fn invalid_argument(msg: &'static str) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg })
    }

    /// Creates a new [`ConfigError`].
    pub fn config(msg: String) -> Self {
        Self::Config(ConfigError {
            msg,
            sequence: None,
        })
    }

    /// Creates a new [`ConfigError`] attributed to a sequence of the batch.
    pub fn config_in_sequence(msg: String, sequence: usize) -> Self {
        Self::Config(ConfigError {
            msg,
            sequence: Some(sequence),
        })
    }

    /// Creates a new [`NoValidPathsError`].
    pub const fn no_valid_paths(position: usize) -> Self {
        Self::NoValidPaths(NoValidPathsError { position })
    }
}

impl fmt::Display for SemiCrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
            Self::NoValidPaths(e) => e.fmt(f),
        }
    }
}

#[cfg(feature = "std")]
impl Error for SemiCrfError {}

/// A specialized Result type.
pub type Result<T, E = SemiCrfError> = core::result::Result<T, E>;
