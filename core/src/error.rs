//! Error and outcome types shared by the filters.
//!
//! Two very different things can happen to a measurement. A statistically
//! implausible observation is *rejected*: that is routine, the filter is left
//! untouched and the caller receives [`UpdateOutcome::Outlier`]. A numerical
//! breakdown (singular innovation covariance, non-finite posterior) is a
//! [`FilterError`]; the prior state is kept and the owner of the filter decides
//! whether to reset or discard it.

use thiserror::Error;

/// Errors raised by the estimation core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("filter has not been initialised")]
    NotInitialised,

    #[error("timestamp {current} ms precedes previous update at {previous} ms")]
    NonMonotonicTimestamp { previous: f64, current: f64 },

    #[error("time step must not be negative, got {0} ms")]
    NegativeTimeStep(f64),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result of a measurement update that completed without numerical failure.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdateOutcome {
    /// The observation was incorporated.
    Accepted { mahalanobis_sq: f64 },
    /// The squared Mahalanobis innovation exceeded the outlier threshold and
    /// the state was left unmodified.
    Outlier { mahalanobis_sq: f64 },
}

impl UpdateOutcome {
    pub fn is_outlier(&self) -> bool {
        matches!(self, UpdateOutcome::Outlier { .. })
    }
    pub fn is_accepted(&self) -> bool {
        matches!(self, UpdateOutcome::Accepted { .. })
    }
    /// Squared Mahalanobis distance of the innovation.
    pub fn mahalanobis_sq(&self) -> f64 {
        match self {
            UpdateOutcome::Accepted { mahalanobis_sq } | UpdateOutcome::Outlier { mahalanobis_sq } => {
                *mahalanobis_sq
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let ok = UpdateOutcome::Accepted { mahalanobis_sq: 1.5 };
        let bad = UpdateOutcome::Outlier { mahalanobis_sq: 20.0 };
        assert!(ok.is_accepted());
        assert!(!ok.is_outlier());
        assert!(bad.is_outlier());
        assert_eq!(ok.mahalanobis_sq(), 1.5);
        assert_eq!(bad.mahalanobis_sq(), 20.0);
    }

    #[test]
    fn error_messages() {
        let e = FilterError::NonMonotonicTimestamp {
            previous: 20.0,
            current: 10.0,
        };
        assert_eq!(e.to_string(), "timestamp 10 ms precedes previous update at 20 ms");
        let e = FilterError::DimensionMismatch {
            expected: 9,
            found: 7,
        };
        assert!(e.to_string().contains("expected 9"));
        let e = FilterError::NegativeTimeStep(-5.0);
        assert_eq!(e.to_string(), "time step must not be negative, got -5 ms");
    }
}
