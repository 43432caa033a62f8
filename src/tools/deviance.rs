//! Per-gene deviance fitting and deviance-based ranking.
//!
//! [`DevianceModel`] is the seam for the deviance-fitting collaborator: given
//! one gene's count vector, the per-spot binomial sizes and an optional batch
//! assignment, it returns a scalar residual deviance (NaN when the gene is
//! unfittable). [`BinomialDeviance`] is the default implementation, the
//! closed-form binomial null deviance the accompanying analysis is built on:
//! unlike a mean-variance alternative it has no convergence loop, so repeated
//! fits on identical input are bit-identical by construction.

use std::cmp::Ordering;

use itertools::Itertools;
use log::debug;
use ndarray::ArrayView1;
use polars::df;
use polars::prelude::*;

use crate::data_structs::counts::BatchAssignment;

/// A scalar deviance fit for a single gene.
///
/// Implementations must be deterministic: identical inputs must produce
/// bit-identical deviances. Fit failures are reported as NaN, never as a
/// panic or an error, so one bad gene cannot block the rest of a batch.
pub trait DevianceModel: Sync {
    /// Residual deviance of the gene's counts under the model's null.
    ///
    /// When `batch` is given, the null absorbs a batch-specific term (one
    /// fitted success probability per batch level) before the residual
    /// deviance is computed.
    fn fit(
        &self,
        gene_id: &str,
        counts: ArrayView1<u32>,
        spot_totals: &[f64],
        batch: Option<&BatchAssignment>,
    ) -> f64;
}

/// Closed-form binomial null deviance.
///
/// With per-spot totals `n_j` and gene counts `y_j`, the null success
/// probability is `π = Σy / Σn` (per batch level in the batched fit) and the
/// residual deviance against the saturated model is
/// `2 Σ [ y ln(y/(nπ)) + (n−y) ln((n−y)/(n(1−π))) ]`, zero-count terms
/// contributing zero. Spots with zero total counts carry no information and
/// are skipped; a gene is unfittable (NaN) only when no spot has positive
/// totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinomialDeviance;

impl DevianceModel for BinomialDeviance {
    fn fit(
        &self,
        gene_id: &str,
        counts: ArrayView1<u32>,
        spot_totals: &[f64],
        batch: Option<&BatchAssignment>,
    ) -> f64 {
        let dev = match batch {
            None => binomial_deviance(counts, spot_totals, |_| 0, 1),
            Some(assignment) => {
                binomial_deviance(
                    counts,
                    spot_totals,
                    |j| assignment.codes()[j],
                    assignment.n_levels(),
                )
            },
        };
        if dev.is_nan() {
            debug!("Deviance fit failed for gene '{}'", gene_id);
        }
        dev
    }
}

fn binomial_deviance<F>(
    counts: ArrayView1<u32>,
    spot_totals: &[f64],
    level_of: F,
    n_levels: usize,
) -> f64
where
    F: Fn(usize) -> usize, {
    debug_assert_eq!(counts.len(), spot_totals.len());

    let mut y_sum = vec![0.0f64; n_levels];
    let mut n_sum = vec![0.0f64; n_levels];
    for (j, &y) in counts.iter().enumerate() {
        let n = spot_totals[j];
        if n <= 0.0 {
            continue;
        }
        let level = level_of(j);
        y_sum[level] += y as f64;
        n_sum[level] += n;
    }
    if n_sum.iter().all(|&n| n <= 0.0) {
        return f64::NAN;
    }

    // Levels without informative spots never contribute terms below, so the
    // placeholder probability is irrelevant.
    let pi = y_sum
        .iter()
        .zip(n_sum.iter())
        .map(|(&y, &n)| if n > 0.0 { y / n } else { 0.0 })
        .collect_vec();

    let mut half_dev = 0.0f64;
    for (j, &y) in counts.iter().enumerate() {
        let n = spot_totals[j];
        if n <= 0.0 {
            continue;
        }
        let y = y as f64;
        debug_assert!(y <= n);
        let p = pi[level_of(j)];
        // π > 0 whenever the level saw a positive count and π < 1 whenever it
        // saw a non-saturated spot, so both logs stay finite.
        if y > 0.0 {
            half_dev += y * (y / (n * p)).ln();
        }
        let rest = n - y;
        if rest > 0.0 {
            half_dev += rest * (rest / (n * (1.0 - p))).ln();
        }
    }
    2.0 * half_dev
}

/// Ranks deviances in descending order: rank 1 is the highest deviance.
///
/// Ties break by stable input order (lowest index wins); NaN deviances rank
/// after every finite deviance, again in input order. The result is always a
/// permutation of `1..=N`.
pub(crate) fn rank_descending(deviance: &[f64]) -> Vec<u32> {
    let mut order = (0..deviance.len()).collect_vec();
    order.sort_by(|&a, &b| {
        match (deviance[a].is_nan(), deviance[b].is_nan()) {
            (true, true) => a.cmp(&b),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                deviance[b]
                    .partial_cmp(&deviance[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            },
        }
    });
    let mut rank = vec![0u32; deviance.len()];
    for (position, &idx) in order.iter().enumerate() {
        rank[idx] = position as u32 + 1;
    }
    rank
}

/// Deviances and ranks over one candidate gene set, one model configuration
/// (unbatched, or batched by a single covariate).
#[derive(Debug, Clone, PartialEq)]
pub struct DevianceRanking {
    gene_ids: Vec<String>,
    deviance: Vec<f64>,
    rank:     Vec<u32>,
    fit_ok:   Vec<bool>,
}

impl DevianceRanking {
    /// Builds the ranking from raw deviances; non-finite deviances are
    /// normalized to NaN and marked as failed fits.
    pub(crate) fn from_deviances(
        gene_ids: Vec<String>,
        deviance: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(gene_ids.len(), deviance.len());
        let deviance = deviance
            .into_iter()
            .map(|d| if d.is_finite() { d } else { f64::NAN })
            .collect_vec();
        let fit_ok = deviance.iter().map(|d| d.is_finite()).collect_vec();
        let rank = rank_descending(&deviance);
        Self {
            gene_ids,
            deviance,
            rank,
            fit_ok,
        }
    }

    pub fn gene_ids(&self) -> &[String] { &self.gene_ids }

    pub fn deviance(&self) -> &[f64] { &self.deviance }

    /// Ranks aligned with [`DevianceRanking::gene_ids`]; a permutation of
    /// `1..=N`.
    pub fn rank(&self) -> &[u32] { &self.rank }

    pub fn fit_ok(&self) -> &[bool] { &self.fit_ok }

    pub fn len(&self) -> usize { self.gene_ids.len() }

    pub fn is_empty(&self) -> bool { self.gene_ids.is_empty() }

    /// Deviance and rank of a single gene, if present.
    pub fn get(
        &self,
        gene_id: &str,
    ) -> Option<(f64, u32)> {
        self.gene_ids
            .iter()
            .position(|id| id == gene_id)
            .map(|i| (self.deviance[i], self.rank[i]))
    }

    /// Materializes the ranking as a table.
    pub fn to_data_frame(&self) -> PolarsResult<DataFrame> {
        df!(
            "gene_id" => self.gene_ids.to_vec(),
            "deviance" => self.deviance.to_vec(),
            "rank" => self.rank.to_vec(),
            "fit_ok" => self.fit_ok.to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;
    use ndarray::arr1;

    use super::*;

    #[test]
    fn test_null_deviance_of_constant_proportion_is_zero() {
        // y_j / n_j identical across spots: the null fits perfectly
        let counts = arr1(&[1u32, 2, 3]);
        let totals = [10.0, 20.0, 30.0];
        let dev =
            BinomialDeviance.fit("g", counts.view(), &totals, None);
        assert_approx_eq!(dev, 0.0);
    }

    #[test]
    fn test_null_deviance_positive_for_uneven_gene() {
        let counts = arr1(&[5u32, 0]);
        let totals = [10.0, 10.0];
        let dev = BinomialDeviance.fit("g", counts.view(), &totals, None);
        assert!(dev > 0.0);
    }

    #[test]
    fn test_batched_deviance_absorbs_batch_structure() {
        // Counts split perfectly by batch: the batched null fits exactly
        let counts = arr1(&[5u32, 5, 0, 0]);
        let totals = [10.0, 10.0, 10.0, 10.0];
        let batch =
            BatchAssignment::from_labels("sample", &["A", "A", "B", "B"]);
        let unbatched =
            BinomialDeviance.fit("g", counts.view(), &totals, None);
        let batched =
            BinomialDeviance.fit("g", counts.view(), &totals, Some(&batch));
        assert!(unbatched > 0.0);
        assert_approx_eq!(batched, 0.0);
        assert!(batched < unbatched);
    }

    #[test]
    fn test_zero_totals_fail_the_fit() {
        let counts = arr1(&[0u32, 0]);
        let totals = [0.0, 0.0];
        let dev = BinomialDeviance.fit("g", counts.view(), &totals, None);
        assert!(dev.is_nan());
    }

    #[test]
    fn test_all_zero_gene_has_zero_deviance() {
        let counts = arr1(&[0u32, 0, 0]);
        let totals = [10.0, 20.0, 30.0];
        let dev = BinomialDeviance.fit("g", counts.view(), &totals, None);
        assert_approx_eq!(dev, 0.0);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let counts = arr1(&[3u32, 7, 1, 9, 4]);
        let totals = [20.0, 30.0, 10.0, 40.0, 25.0];
        let first = BinomialDeviance.fit("g", counts.view(), &totals, None);
        let second = BinomialDeviance.fit("g", counts.view(), &totals, None);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn test_rank_descending_is_permutation() {
        let ranks = rank_descending(&[0.5, 3.0, 2.0, 10.0]);
        assert_eq!(ranks, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_rank_ties_break_by_input_order() {
        let ranks = rank_descending(&[2.0, 5.0, 2.0]);
        assert_eq!(ranks, vec![2, 1, 3]);
    }

    #[test]
    fn test_rank_nan_goes_last() {
        let ranks = rank_descending(&[f64::NAN, 5.0, 2.0]);
        assert_eq!(ranks, vec![3, 1, 2]);
    }

    #[test]
    fn test_ranking_marks_failed_fits() {
        let ranking = DevianceRanking::from_deviances(
            vec!["g1".into(), "g2".into(), "g3".into()],
            vec![4.0, f64::INFINITY, 1.0],
        );
        assert_eq!(ranking.fit_ok(), &[true, false, true]);
        assert_eq!(ranking.rank(), &[1, 3, 2]);
        assert!(ranking.deviance()[1].is_nan());
        assert_eq!(ranking.get("g3"), Some((1.0, 2)));
    }
}
