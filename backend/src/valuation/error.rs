//! Error kinds raised by the pipeline stages

use serde::Serialize;
use thiserror::Error;

/// Pipeline stage names, used to tag every user-visible failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    DataProvider,
    Normalizer,
    ValuationEngine,
    ModelRunner,
    MarketComparator,
    CrossValidationChecker,
    SourceConsistencyAuditor,
    AdvisoryPolicyEngine,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::DataProvider => "DataProvider",
            Stage::Normalizer => "Normalizer",
            Stage::ValuationEngine => "ValuationEngine",
            Stage::ModelRunner => "ModelRunner",
            Stage::MarketComparator => "MarketComparator",
            Stage::CrossValidationChecker => "CrossValidationChecker",
            Stage::SourceConsistencyAuditor => "SourceConsistencyAuditor",
            Stage::AdvisoryPolicyEngine => "AdvisoryPolicyEngine",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValuationError {
    /// Required subject attribute missing; the pipeline stops before valuation
    #[error("{stage}: malformed input: {detail}")]
    MalformedInput { stage: Stage, detail: String },

    /// No usable data for a method or collaborator
    #[error("{stage}: data unavailable: {detail}")]
    DataUnavailable { stage: Stage, detail: String },

    /// Every valuation method was skipped
    #[error("{stage}: no valuation method available ({detail})")]
    NoMethodAvailable { stage: Stage, detail: String },

    /// Collaborator exceeded its time bound on every attempt
    #[error("{stage}: upstream timeout after {attempts} attempts")]
    UpstreamTimeout { stage: Stage, attempts: u32 },

    #[error("{stage}: request cancelled")]
    Cancelled { stage: Stage },
}

impl ValuationError {
    pub fn malformed(stage: Stage, detail: impl Into<String>) -> Self {
        ValuationError::MalformedInput { stage, detail: detail.into() }
    }

    pub fn unavailable(stage: Stage, detail: impl Into<String>) -> Self {
        ValuationError::DataUnavailable { stage, detail: detail.into() }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ValuationError::MalformedInput { stage, .. }
            | ValuationError::DataUnavailable { stage, .. }
            | ValuationError::NoMethodAvailable { stage, .. }
            | ValuationError::UpstreamTimeout { stage, .. }
            | ValuationError::Cancelled { stage } => *stage,
        }
    }

    /// Whether this error stops the whole request.
    ///
    /// Collaborator failures are not: the stage degrades and records the gap.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ValuationError::MalformedInput { .. }
                | ValuationError::NoMethodAvailable { .. }
                | ValuationError::Cancelled { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ValuationError>;
