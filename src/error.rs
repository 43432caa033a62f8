use std::error::Error;
use std::fmt::{Display, Formatter};

use polars::error::PolarsError;

/// Errors surfaced by the scoring pipeline.
///
/// [`BiasError::InvalidInput`] and [`BiasError::DegenerateInput`] abort the
/// covariate they occur in. Per-gene fit failures are never errors: they are
/// recorded as NaN deviances with a cleared `fit_ok` flag in the affected row
/// so a single bad gene cannot block the rest of the batch.
#[derive(Debug)]
pub enum BiasError {
    /// Candidate genes missing from the matrix, duplicate candidate ids,
    /// a missing covariate column, a batch assignment of the wrong length
    /// or a threshold vector that does not match the covariate count.
    InvalidInput(String),
    /// Standardization moments are undefined for a covariate: fewer than two
    /// finite values, a non-finite standard deviation, or a zero standard
    /// deviation under [`ZeroSdPolicy::Error`].
    ///
    /// [`ZeroSdPolicy::Error`]: crate::tools::bias::ZeroSdPolicy::Error
    DegenerateInput {
        covariate: String,
        statistic: &'static str,
    },
    /// Propagated failure from the table layer.
    Polars(PolarsError),
}

impl Display for BiasError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            BiasError::InvalidInput(desc) => {
                write!(f, "Invalid input: {}", desc)
            },
            BiasError::DegenerateInput {
                covariate,
                statistic,
            } => {
                write!(
                    f,
                    "Cannot standardize '{}' for covariate '{}': zero or undefined standard deviation",
                    statistic, covariate
                )
            },
            BiasError::Polars(e) => write!(f, "{}", e),
        }
    }
}

impl Error for BiasError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BiasError::Polars(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PolarsError> for BiasError {
    fn from(value: PolarsError) -> Self { BiasError::Polars(value) }
}
