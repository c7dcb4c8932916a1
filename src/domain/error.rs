//! Domain error types.

/// Top-level error type for quantlab.
#[derive(Debug, thiserror::Error)]
pub enum QuantlabError {
    /// Input data is unusable: insufficient history, misaligned dates, or a
    /// covariance matrix that shrinkage could not make positive-definite.
    #[error("data quality error: {reason}")]
    DataQuality { reason: String },

    /// A matrix inversion or decomposition was singular or ill-conditioned.
    #[error("optimization error in {matrix}: {reason} (condition estimate {condition:e})")]
    Optimization {
        matrix: String,
        reason: String,
        condition: f64,
    },

    /// No weight vector satisfies the constraints.
    #[error("infeasible constraints: {reason}")]
    Infeasible { reason: String },

    /// Invalid parameter combination, detected before computation.
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QuantlabError {
    pub fn data_quality(reason: impl Into<String>) -> Self {
        QuantlabError::DataQuality {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        QuantlabError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn infeasible(reason: impl Into<String>) -> Self {
        QuantlabError::Infeasible {
            reason: reason.into(),
        }
    }
}

impl From<&QuantlabError> for std::process::ExitCode {
    fn from(err: &QuantlabError) -> Self {
        let code: u8 = match err {
            QuantlabError::Io(_) => 1,
            QuantlabError::Configuration { .. }
            | QuantlabError::ConfigParse { .. }
            | QuantlabError::ConfigMissing { .. }
            | QuantlabError::ConfigInvalid { .. } => 2,
            QuantlabError::Data { .. } | QuantlabError::Csv(_) => 3,
            QuantlabError::Optimization { .. } | QuantlabError::Infeasible { .. } => 4,
            QuantlabError::DataQuality { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
