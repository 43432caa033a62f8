//! Batch-bias scoring over a candidate gene set.
//!
//! [`BiasScorer`] computes the unbatched deviance/rank baseline once, a
//! batched result per covariate, joins the two sides per gene and
//! standardizes the relative deviance change and the rank shift into nSD
//! scores ([`BiasScorer::feature_select`]). [`bias_detect`] turns nSD scores
//! into outlier flags against caller-supplied thresholds, [`biased_genes`]
//! collects the flagged set (OR semantics) and [`refine`] removes it from the
//! candidate list.
//!
//! Covariates are scored independently against the same baseline; their
//! moments are never pooled. Scoring is deterministic and single-shot: no
//! retries, no partial recovery beyond the per-gene NaN rows.

use hashbrown::HashSet;
use itertools::Itertools;
use log::{debug, info, warn};
use polars::df;
use polars::prelude::*;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::data_structs::bias_frame::BiasFrame;
use crate::data_structs::counts::{BatchAssignment, CountMatrix};
use crate::error::BiasError;
use crate::tools::deviance::{BinomialDeviance, DevianceModel, DevianceRanking};
use crate::utils::finite_moments;

/// What to do with candidate genes absent from the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingPolicy {
    /// Fail with [`BiasError::InvalidInput`] naming the missing genes.
    #[default]
    Error,
    /// Narrow to the genes present, logging a warning. Callers must compare
    /// output row counts against the candidate list length.
    Intersect,
}

/// What to do when a standardized column has exactly zero spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZeroSdPolicy {
    /// Map the constant column to all-zero nSD scores, logging a warning.
    /// Every gene sits exactly at the mean, so zero SDs from it is the
    /// meaningful score; a ranking that does not move at all is the expected
    /// no-bias case, not a failure.
    #[default]
    Flatten,
    /// Fail the covariate with [`BiasError::DegenerateInput`].
    Error,
}

/// Options for [`BiasScorer::feature_select`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureSelectConfig {
    pub missing_candidates: MissingPolicy,
    pub zero_sd:            ZeroSdPolicy,
}

/// Which nSD column(s) [`bias_detect`] thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdKind {
    Dev,
    Rank,
    Both,
}

/// An nSD threshold, either shared by all covariates or one per covariate
/// (positionally matched against the frame order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NsdThreshold {
    Global(f64),
    PerCovariate(Vec<f64>),
}

impl NsdThreshold {
    fn validate(
        &self,
        n_covariates: usize,
    ) -> Result<(), BiasError> {
        match self {
            NsdThreshold::Global(_) => Ok(()),
            NsdThreshold::PerCovariate(values) => {
                if values.len() != n_covariates {
                    Err(BiasError::InvalidInput(format!(
                        "{} thresholds supplied for {} covariates",
                        values.len(),
                        n_covariates
                    )))
                }
                else {
                    Ok(())
                }
            },
        }
    }

    /// Threshold for the covariate at `idx`. Call [`NsdThreshold::validate`]
    /// first.
    fn get(
        &self,
        idx: usize,
    ) -> f64 {
        match self {
            NsdThreshold::Global(value) => *value,
            NsdThreshold::PerCovariate(values) => values[idx],
        }
    }
}

impl From<f64> for NsdThreshold {
    fn from(value: f64) -> Self { NsdThreshold::Global(value) }
}

impl From<Vec<f64>> for NsdThreshold {
    fn from(values: Vec<f64>) -> Self { NsdThreshold::PerCovariate(values) }
}

/// Options for [`bias_detect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasDetectConfig {
    pub threshold: ThresholdKind,
    pub nsd_dev:   NsdThreshold,
    pub nsd_rank:  NsdThreshold,
}

impl Default for BiasDetectConfig {
    fn default() -> Self {
        Self {
            threshold: ThresholdKind::Both,
            nsd_dev:   NsdThreshold::Global(2.0),
            nsd_rank:  NsdThreshold::Global(2.0),
        }
    }
}

/// Deviance/rank scorer over one count matrix.
///
/// Holds the matrix reference, the deviance model and the precomputed
/// per-spot totals; every operation on it is read-only.
pub struct BiasScorer<'m, D: DevianceModel = BinomialDeviance> {
    matrix:      &'m CountMatrix,
    model:       D,
    spot_totals: Vec<f64>,
}

impl<'m> BiasScorer<'m, BinomialDeviance> {
    pub fn new(matrix: &'m CountMatrix) -> Self {
        Self::with_model(matrix, BinomialDeviance)
    }
}

impl<'m, D: DevianceModel> BiasScorer<'m, D> {
    /// Creates a scorer with a custom deviance model.
    pub fn with_model(
        matrix: &'m CountMatrix,
        model: D,
    ) -> Self {
        let spot_totals = matrix.spot_totals();
        Self {
            matrix,
            model,
            spot_totals,
        }
    }

    pub fn matrix(&self) -> &CountMatrix { self.matrix }

    /// Maps candidate gene ids to row indices, applying `policy` to genes
    /// absent from the matrix. Duplicate ids and an empty candidate list are
    /// always rejected.
    fn resolve_candidates(
        &self,
        candidates: &[String],
        policy: MissingPolicy,
    ) -> Result<Vec<usize>, BiasError> {
        if candidates.is_empty() {
            return Err(BiasError::InvalidInput(
                "empty candidate gene list".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(candidates.len());
        for id in candidates {
            if !seen.insert(id.as_str()) {
                return Err(BiasError::InvalidInput(format!(
                    "duplicate candidate gene id '{}'",
                    id
                )));
            }
        }

        let (found, missing): (Vec<_>, Vec<_>) = candidates
            .iter()
            .partition_map(|id| match self.matrix.gene_idx(id) {
                Some(idx) => itertools::Either::Left(idx),
                None => itertools::Either::Right(id.as_str()),
            });
        if !missing.is_empty() {
            match policy {
                MissingPolicy::Error => {
                    return Err(BiasError::InvalidInput(format!(
                        "{} candidate gene(s) not found in matrix: {}",
                        missing.len(),
                        missing.iter().take(10).join(", ")
                    )));
                },
                MissingPolicy::Intersect => {
                    warn!(
                        "Dropping {} candidate gene(s) not found in matrix",
                        missing.len()
                    );
                },
            }
        }
        if found.is_empty() {
            return Err(BiasError::InvalidInput(
                "no candidate gene present in the matrix".to_string(),
            ));
        }
        Ok(found)
    }

    fn ranking(
        &self,
        indices: &[usize],
        batch: Option<&BatchAssignment>,
    ) -> DevianceRanking {
        let gene_ids = indices
            .iter()
            .map(|&i| self.matrix.gene_ids()[i].clone())
            .collect_vec();
        let deviance = indices
            .iter()
            .map(|&i| {
                self.model.fit(
                    &self.matrix.gene_ids()[i],
                    self.matrix.counts_row(i),
                    &self.spot_totals,
                    batch,
                )
            })
            .collect_vec();
        DevianceRanking::from_deviances(gene_ids, deviance)
    }

    /// Unbatched deviance/rank baseline over the candidate set.
    ///
    /// Candidates must all be present in the matrix (strict validation); use
    /// [`BiasScorer::feature_select`] with
    /// [`MissingPolicy::Intersect`] for silent narrowing. Deterministic:
    /// repeated calls on identical input return bit-identical deviances and
    /// ranks.
    pub fn compute_baseline(
        &self,
        candidates: &[String],
    ) -> Result<DevianceRanking, BiasError> {
        let indices =
            self.resolve_candidates(candidates, MissingPolicy::Error)?;
        Ok(self.ranking(&indices, None))
    }

    /// Batched deviance/rank result for one covariate.
    pub fn compute_batched(
        &self,
        candidates: &[String],
        assignment: &BatchAssignment,
    ) -> Result<DevianceRanking, BiasError> {
        self.validate_assignment(assignment)?;
        let indices =
            self.resolve_candidates(candidates, MissingPolicy::Error)?;
        Ok(self.ranking(&indices, Some(assignment)))
    }

    fn validate_assignment(
        &self,
        assignment: &BatchAssignment,
    ) -> Result<(), BiasError> {
        if assignment.len() != self.matrix.n_spots() {
            return Err(BiasError::InvalidInput(format!(
                "batch assignment '{}' covers {} spots but the matrix has {}",
                assignment.covariate(),
                assignment.len(),
                self.matrix.n_spots()
            )));
        }
        Ok(())
    }

    /// Scores every covariate against the shared unbatched baseline.
    ///
    /// Returns one [`BiasFrame`] per covariate, in input order, each
    /// independently standardized. Covariates are scored in parallel; this is
    /// purely an optimization, results do not depend on it.
    pub fn feature_select(
        &self,
        candidates: &[String],
        covariates: &[BatchAssignment],
        config: &FeatureSelectConfig,
    ) -> Result<Vec<BiasFrame>, BiasError> {
        let indices =
            self.resolve_candidates(candidates, config.missing_candidates)?;
        for assignment in covariates {
            self.validate_assignment(assignment)?;
        }
        let baseline = self.ranking(&indices, None);
        info!(
            "Scoring {} candidate gene(s) against {} covariate(s)",
            indices.len(),
            covariates.len()
        );

        covariates
            .par_iter()
            .map(|assignment| {
                self.score_covariate(&indices, &baseline, assignment, config)
            })
            .collect()
    }

    fn score_covariate(
        &self,
        indices: &[usize],
        baseline: &DevianceRanking,
        assignment: &BatchAssignment,
        config: &FeatureSelectConfig,
    ) -> Result<BiasFrame, BiasError> {
        let batched = self.ranking(indices, Some(assignment));
        let n = indices.len();

        let mut rel_change_dev = Vec::with_capacity(n);
        let mut rank_diff = Vec::with_capacity(n);
        let mut fit_ok = Vec::with_capacity(n);
        for i in 0..n {
            let ok = baseline.fit_ok()[i] && batched.fit_ok()[i];
            fit_ok.push(ok);
            let d0 = baseline.deviance()[i];
            let db = batched.deviance()[i];
            let rel = if ok && d0 != 0.0 {
                (d0 - db) / d0
            }
            else {
                f64::NAN
            };
            rel_change_dev.push(rel);
            rank_diff
                .push(batched.rank()[i] as i32 - baseline.rank()[i] as i32);
        }

        let n_failed = fit_ok.iter().filter(|ok| !**ok).count();
        if n_failed > 0 {
            warn!(
                "{} gene(s) had a failed deviance fit for covariate '{}'",
                n_failed,
                assignment.covariate()
            );
        }

        let nsd_dev = standardize(
            &rel_change_dev,
            assignment.covariate(),
            "rel_change_dev",
            config.zero_sd,
        )?;
        let rank_diff_f64 =
            rank_diff.iter().map(|&d| d as f64).collect_vec();
        let nsd_rank = standardize(
            &rank_diff_f64,
            assignment.covariate(),
            "rank_diff",
            config.zero_sd,
        )?;

        let gene_names = indices
            .iter()
            .map(|&i| self.matrix.gene_names()[i].clone())
            .collect_vec();
        let data = df!(
            "gene_id" => baseline.gene_ids().to_vec(),
            "gene_name" => gene_names,
            "dev_nobatch" => baseline.deviance().to_vec(),
            "dev_batch" => batched.deviance().to_vec(),
            "rel_change_dev" => rel_change_dev,
            "rank_nobatch" => baseline.rank().to_vec(),
            "rank_batch" => batched.rank().to_vec(),
            "rank_diff" => rank_diff,
            "nSD_dev" => nsd_dev,
            "nSD_rank" => nsd_rank,
            "fit_ok" => fit_ok,
            "dev_outlier" => vec![false; n],
            "rank_outlier" => vec![false; n],
        )?;
        debug!(
            "Covariate '{}': scored {} gene(s), {} level(s)",
            assignment.covariate(),
            n,
            assignment.n_levels()
        );
        Ok(BiasFrame::new_unchecked(assignment.covariate(), data))
    }
}

/// Z-scores over the finite entries of `values`, population convention.
///
/// NaN entries stay NaN. Undefined moments (fewer than two finite values, or
/// a non-finite SD) are always [`BiasError::DegenerateInput`]; an exactly
/// zero SD follows `policy`. NaN/Inf never leak out of a zero-SD column.
fn standardize(
    values: &[f64],
    covariate: &str,
    statistic: &'static str,
    policy: ZeroSdPolicy,
) -> Result<Vec<f64>, BiasError> {
    let (mean, sd, n_finite) = finite_moments(values);
    if n_finite < 2 || !sd.is_finite() {
        return Err(BiasError::DegenerateInput {
            covariate: covariate.to_string(),
            statistic,
        });
    }
    if sd == 0.0 {
        match policy {
            ZeroSdPolicy::Error => {
                return Err(BiasError::DegenerateInput {
                    covariate: covariate.to_string(),
                    statistic,
                });
            },
            ZeroSdPolicy::Flatten => {
                warn!(
                    "Zero spread in '{}' for covariate '{}': nSD flattened to 0",
                    statistic, covariate
                );
                return Ok(values
                    .iter()
                    .map(|v| if v.is_finite() { 0.0 } else { f64::NAN })
                    .collect_vec());
            },
        }
    }
    debug!(
        "Standardizing '{}' for covariate '{}': mean={:.4e}, sd={:.4e}, n={}",
        statistic, covariate, mean, sd, n_finite
    );
    Ok(values
        .iter()
        .map(|v| {
            if v.is_finite() {
                (v - mean) / sd
            }
            else {
                f64::NAN
            }
        })
        .collect_vec())
}

/// Flags outlier genes in each frame against the configured thresholds.
///
/// A gene is flagged when `|nSD| >= threshold`; NaN scores never trip a
/// threshold. Under [`ThresholdKind::Dev`] the `rank_outlier` column stays
/// false (and vice versa). Threshold vectors are positionally matched against
/// the frames; a length mismatch fails with [`BiasError::InvalidInput`]
/// before any frame is touched.
pub fn bias_detect(
    frames: Vec<BiasFrame>,
    config: &BiasDetectConfig,
) -> Result<Vec<BiasFrame>, BiasError> {
    let n_covariates = frames.len();
    if matches!(config.threshold, ThresholdKind::Dev | ThresholdKind::Both) {
        config.nsd_dev.validate(n_covariates)?;
    }
    if matches!(config.threshold, ThresholdKind::Rank | ThresholdKind::Both) {
        config.nsd_rank.validate(n_covariates)?;
    }

    frames
        .into_iter()
        .enumerate()
        .map(|(idx, frame)| {
            let (covariate, mut data) = frame.into_parts();

            let dev_flags = match config.threshold {
                ThresholdKind::Dev | ThresholdKind::Both => {
                    threshold_flags(
                        data.column(BiasFrame::nsd_dev_col())?.f64()?,
                        config.nsd_dev.get(idx),
                    )
                },
                ThresholdKind::Rank => vec![false; data.height()],
            };
            let rank_flags = match config.threshold {
                ThresholdKind::Rank | ThresholdKind::Both => {
                    threshold_flags(
                        data.column(BiasFrame::nsd_rank_col())?.f64()?,
                        config.nsd_rank.get(idx),
                    )
                },
                ThresholdKind::Dev => vec![false; data.height()],
            };

            let n_dev = dev_flags.iter().filter(|f| **f).count();
            let n_rank = rank_flags.iter().filter(|f| **f).count();
            data.with_column(Column::new(
                BiasFrame::dev_outlier_col().into(),
                dev_flags,
            ))?;
            data.with_column(Column::new(
                BiasFrame::rank_outlier_col().into(),
                rank_flags,
            ))?;
            info!(
                "Covariate '{}': {} dev outlier(s), {} rank outlier(s)",
                covariate, n_dev, n_rank
            );
            Ok(BiasFrame::new_unchecked(&covariate, data))
        })
        .collect()
}

fn threshold_flags(
    nsd: &Float64Chunked,
    threshold: f64,
) -> Vec<bool> {
    nsd.into_iter()
        .map(|value| {
            value.is_some_and(|v| v.is_finite() && v.abs() >= threshold)
        })
        .collect_vec()
}

/// Gene ids flagged in any frame by either outlier column (OR semantics),
/// deduplicated preserving first-seen order.
pub fn biased_genes(
    frames: &[BiasFrame]
) -> Result<Vec<String>, BiasError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for frame in frames {
        for gene_id in frame.outlier_gene_ids()? {
            if seen.insert(gene_id.clone()) {
                out.push(gene_id);
            }
        }
    }
    Ok(out)
}

/// Pure set difference: candidates minus biased genes, preserving candidate
/// order.
pub fn refine(
    candidates: &[String],
    biased: &[String],
) -> Vec<String> {
    let biased: HashSet<&str> =
        biased.iter().map(String::as_str).collect();
    candidates
        .iter()
        .filter(|id| !biased.contains(id.as_str()))
        .cloned()
        .collect_vec()
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    fn strings(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect_vec()
    }

    fn small_matrix() -> CountMatrix {
        CountMatrix::new(
            arr2(&[
                [5u32, 0, 3, 2],
                [1, 1, 1, 1],
                [0, 4, 0, 4],
                [2, 2, 0, 0],
            ]),
            strings(&["g1", "g2", "g3", "g4"]),
            None,
            strings(&["s1", "s2", "s3", "s4"]),
        )
        .unwrap()
    }

    #[test]
    fn test_refine_identities() {
        let candidates = strings(&["g1", "g2", "g3"]);
        assert_eq!(refine(&candidates, &[]), candidates);
        assert!(refine(&candidates, &candidates).is_empty());
        assert_eq!(
            refine(&candidates, &strings(&["g2"])),
            strings(&["g1", "g3"])
        );
    }

    #[test]
    fn test_missing_candidate_is_invalid_input() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let res = scorer.compute_baseline(&strings(&["g1", "nope"]));
        assert!(matches!(res, Err(BiasError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_candidate_is_invalid_input() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let res = scorer.compute_baseline(&strings(&["g1", "g1"]));
        assert!(matches!(res, Err(BiasError::InvalidInput(_))));
    }

    #[test]
    fn test_intersect_policy_narrows() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let config = FeatureSelectConfig {
            missing_candidates: MissingPolicy::Intersect,
            ..Default::default()
        };
        let covariates = [BatchAssignment::from_labels(
            "sample",
            &["A", "A", "B", "B"],
        )];
        let frames = scorer
            .feature_select(
                &strings(&["g1", "g3", "missing"]),
                &covariates,
                &config,
            )
            .unwrap();
        assert_eq!(frames[0].height(), 2);
    }

    #[test]
    fn test_baseline_ranks_are_permutation() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let baseline = scorer
            .compute_baseline(&strings(&["g1", "g2", "g3", "g4"]))
            .unwrap();
        let mut ranks = baseline.rank().to_vec();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_assignment_length_validated() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let assignment = BatchAssignment::from_labels("sample", &["A", "B"]);
        let res =
            scorer.compute_batched(&strings(&["g1", "g2"]), &assignment);
        assert!(matches!(res, Err(BiasError::InvalidInput(_))));
    }

    #[test]
    fn test_standardize_moments() {
        let scores = standardize(
            &[0.0, 0.0, 0.0, 0.0, 0.8333333333333334],
            "sample",
            "rel_change_dev",
            ZeroSdPolicy::Flatten,
        )
        .unwrap();
        // Population SD: the single outlier sits at exactly +2 SD
        assert!((scores[4] - 2.0).abs() < 1e-12);
        assert!((scores[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_standardize_flattens_constant_column() {
        let scores = standardize(
            &[3.0, 3.0, 3.0],
            "sample",
            "rank_diff",
            ZeroSdPolicy::Flatten,
        )
        .unwrap();
        assert_eq!(scores, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_standardize_zero_sd_error_policy() {
        let res = standardize(
            &[3.0, 3.0, 3.0],
            "sample",
            "rank_diff",
            ZeroSdPolicy::Error,
        );
        assert!(matches!(res, Err(BiasError::DegenerateInput { .. })));
    }

    #[test]
    fn test_standardize_rejects_undefined_moments() {
        let res = standardize(
            &[f64::NAN, 1.0],
            "sample",
            "rel_change_dev",
            ZeroSdPolicy::Flatten,
        );
        assert!(matches!(res, Err(BiasError::DegenerateInput { .. })));
    }

    #[test]
    fn test_standardize_keeps_nan_rows() {
        let scores = standardize(
            &[1.0, 2.0, 3.0, f64::NAN],
            "sample",
            "rel_change_dev",
            ZeroSdPolicy::Flatten,
        )
        .unwrap();
        assert!(scores[3].is_nan());
        assert!(scores[..3].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_threshold_vector_length_mismatch() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let covariates = [BatchAssignment::from_labels(
            "sample",
            &["A", "A", "B", "B"],
        )];
        let frames = scorer
            .feature_select(
                &strings(&["g1", "g2", "g3", "g4"]),
                &covariates,
                &FeatureSelectConfig::default(),
            )
            .unwrap();
        let config = BiasDetectConfig {
            threshold: ThresholdKind::Dev,
            nsd_dev:   vec![1.0, 2.0].into(),
            nsd_rank:  2.0.into(),
        };
        assert!(matches!(
            bias_detect(frames, &config),
            Err(BiasError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dev_threshold_leaves_rank_flags_false() {
        let matrix = small_matrix();
        let scorer = BiasScorer::new(&matrix);
        let covariates = [BatchAssignment::from_labels(
            "sample",
            &["A", "A", "B", "B"],
        )];
        let frames = scorer
            .feature_select(
                &strings(&["g1", "g2", "g3", "g4"]),
                &covariates,
                &FeatureSelectConfig::default(),
            )
            .unwrap();
        let config = BiasDetectConfig {
            threshold: ThresholdKind::Dev,
            nsd_dev:   0.0.into(),
            nsd_rank:  0.0.into(),
        };
        let flagged = bias_detect(frames, &config).unwrap();
        // Zero dev threshold flags every finite score; rank side untouched
        assert!(flagged[0].n_dev_outliers().unwrap() > 0);
        assert_eq!(flagged[0].n_rank_outliers().unwrap(), 0);
    }
}
