//! Shared helpers: polars schema construction from parallel name/dtype arrays
//! and moment computation over the finite subset of a column.

use itertools::Itertools;
use log::warn;
use polars::prelude::*;
use statrs::statistics::Statistics;

/// Creates a schema from separate arrays of names and data types.
pub(crate) fn schema_from_arrays(
    names: &[&str],
    dtypes: &[DataType],
) -> Schema {
    if names.len() != dtypes.len() {
        warn!(
            "Mismatch between names and dtypes array lengths: {} vs {}",
            names.len(),
            dtypes.len()
        );
    }
    Schema::from_iter(names.iter().cloned().map_into().zip(dtypes.iter().cloned()))
}

/// Creates a hashmap from separate arrays of names and data types.
pub(crate) fn hashmap_from_arrays<'a>(
    names: &[&'a str],
    dtypes: &[DataType],
) -> PlHashMap<&'a str, DataType> {
    if names.len() != dtypes.len() {
        warn!(
            "Mismatch between names and dtypes array lengths: {} vs {}",
            names.len(),
            dtypes.len()
        );
    }
    PlHashMap::from_iter(names.iter().cloned().map_into().zip(dtypes.iter().cloned()))
}

/// Mean and population standard deviation over the finite entries of `values`,
/// plus the finite count. NaN and infinite entries are skipped, not zeroed.
///
/// The population (1/N) convention is deliberate: nSD scores are reported
/// against the spread of the candidate set itself, not an estimate of a wider
/// population.
pub(crate) fn finite_moments(values: &[f64]) -> (f64, f64, usize) {
    let finite = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect_vec();
    if finite.is_empty() {
        return (f64::NAN, f64::NAN, 0);
    }
    let mean = finite.iter().mean();
    let sd = finite.iter().population_std_dev();
    (mean, sd, finite.len())
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::finite_moments;

    #[test]
    fn test_finite_moments() {
        let (mean, sd, n) = finite_moments(&[1.0, 2.0, 3.0, 4.0]);
        assert_approx_eq!(mean, 2.5);
        // Population convention: sqrt(mean of squared deviations)
        assert_approx_eq!(sd, (1.25f64).sqrt());
        assert_eq!(n, 4);
    }

    #[test]
    fn test_finite_moments_skips_non_finite() {
        let (mean, sd, n) =
            finite_moments(&[f64::NAN, 1.0, f64::INFINITY, 3.0]);
        assert_approx_eq!(mean, 2.0);
        assert_approx_eq!(sd, 1.0);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_finite_moments_empty() {
        let (mean, sd, n) = finite_moments(&[f64::NAN]);
        assert!(mean.is_nan());
        assert!(sd.is_nan());
        assert_eq!(n, 0);
    }
}
