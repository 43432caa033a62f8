//! Immutable genes × spots count matrix and per-spot batch covariate
//! assignments.
//!
//! [`CountMatrix`] is the rectangular input every scoring operation reads
//! from: non-negative integer counts, rows indexed by a unique gene id with a
//! parallel display name, columns indexed by spot (or cell) id. Covariate
//! label columns live in an optional spot-metadata [`DataFrame`] attached via
//! [`CountMatrix::with_spot_meta`] and are turned into [`BatchAssignment`]s
//! with [`CountMatrix::batch_assignment`].

use hashbrown::HashMap;
use itertools::Itertools;
use log::debug;
use ndarray::{Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::BiasError;

/// Genes × spots matrix of non-negative integer counts.
///
/// Immutable after construction. Construction validates that dimensions match
/// the id vectors and that gene ids are unique.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts:     Array2<u32>,
    gene_ids:   Vec<String>,
    gene_names: Vec<String>,
    spot_ids:   Vec<String>,
    gene_index: HashMap<String, usize>,
    spot_meta:  Option<DataFrame>,
}

impl CountMatrix {
    /// Creates a new matrix.
    ///
    /// `gene_names` falls back to `gene_ids` when [`None`]. Fails with
    /// [`BiasError::InvalidInput`] on dimension mismatches or duplicate gene
    /// ids.
    pub fn new(
        counts: Array2<u32>,
        gene_ids: Vec<String>,
        gene_names: Option<Vec<String>>,
        spot_ids: Vec<String>,
    ) -> Result<Self, BiasError> {
        if counts.nrows() != gene_ids.len() {
            return Err(BiasError::InvalidInput(format!(
                "count matrix has {} rows but {} gene ids were supplied",
                counts.nrows(),
                gene_ids.len()
            )));
        }
        if counts.ncols() != spot_ids.len() {
            return Err(BiasError::InvalidInput(format!(
                "count matrix has {} columns but {} spot ids were supplied",
                counts.ncols(),
                spot_ids.len()
            )));
        }
        let gene_names = match gene_names {
            Some(names) => {
                if names.len() != gene_ids.len() {
                    return Err(BiasError::InvalidInput(format!(
                        "{} gene names supplied for {} gene ids",
                        names.len(),
                        gene_ids.len()
                    )));
                }
                names
            },
            None => gene_ids.clone(),
        };

        let mut gene_index = HashMap::with_capacity(gene_ids.len());
        for (idx, id) in gene_ids.iter().enumerate() {
            if gene_index.insert(id.clone(), idx).is_some() {
                return Err(BiasError::InvalidInput(format!(
                    "duplicate gene id '{}' in count matrix",
                    id
                )));
            }
        }

        debug!(
            "Constructed count matrix: {} genes x {} spots",
            counts.nrows(),
            counts.ncols()
        );
        Ok(Self {
            counts,
            gene_ids,
            gene_names,
            spot_ids,
            gene_index,
            spot_meta: None,
        })
    }

    /// Attaches spot metadata (covariate label columns).
    ///
    /// The metadata height must equal the spot count.
    pub fn with_spot_meta(
        mut self,
        meta: DataFrame,
    ) -> Result<Self, BiasError> {
        if meta.height() != self.n_spots() {
            return Err(BiasError::InvalidInput(format!(
                "spot metadata has {} rows but the matrix has {} spots",
                meta.height(),
                self.n_spots()
            )));
        }
        self.spot_meta = Some(meta);
        Ok(self)
    }

    pub fn n_genes(&self) -> usize { self.counts.nrows() }

    pub fn n_spots(&self) -> usize { self.counts.ncols() }

    pub fn gene_ids(&self) -> &[String] { &self.gene_ids }

    pub fn gene_names(&self) -> &[String] { &self.gene_names }

    pub fn spot_ids(&self) -> &[String] { &self.spot_ids }

    pub fn spot_meta(&self) -> Option<&DataFrame> { self.spot_meta.as_ref() }

    /// Row index of a gene id, if present.
    pub fn gene_idx(
        &self,
        gene_id: &str,
    ) -> Option<usize> {
        self.gene_index.get(gene_id).copied()
    }

    /// Count vector of the gene at `idx` across all spots.
    pub fn counts_row(
        &self,
        idx: usize,
    ) -> ArrayView1<u32> {
        self.counts.row(idx)
    }

    /// Total counts per spot, summed over all genes of the matrix (not only
    /// candidates). These are the binomial sizes of the deviance fits.
    pub fn spot_totals(&self) -> Vec<f64> {
        self.counts
            .fold_axis(Axis(0), 0.0f64, |acc, &v| acc + v as f64)
            .to_vec()
    }

    /// Builds a [`BatchAssignment`] from a named spot-metadata column.
    ///
    /// Fails with [`BiasError::InvalidInput`] when no metadata is attached,
    /// the column is missing, or the column contains nulls.
    pub fn batch_assignment(
        &self,
        column: &str,
    ) -> Result<BatchAssignment, BiasError> {
        let meta = self.spot_meta.as_ref().ok_or_else(|| {
            BiasError::InvalidInput(format!(
                "covariate column '{}' requested but no spot metadata is attached",
                column
            ))
        })?;
        let labels_col = meta.column(column).map_err(|_| {
            BiasError::InvalidInput(format!(
                "covariate column '{}' not found in spot metadata",
                column
            ))
        })?;
        if labels_col.null_count() != 0 {
            return Err(BiasError::InvalidInput(format!(
                "covariate column '{}' contains {} null labels",
                column,
                labels_col.null_count()
            )));
        }
        let labels_col = labels_col.cast(&DataType::String)?;
        let labels = labels_col
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect_vec();
        Ok(BatchAssignment::from_labels(column, &labels))
    }
}

/// A per-spot categorical label for one batch covariate.
///
/// Labels are stored as level codes in first-occurrence order; the level
/// names are kept for reporting. Covariates are always tested independently,
/// never jointly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAssignment {
    covariate: String,
    codes:     Vec<usize>,
    levels:    Vec<String>,
}

impl BatchAssignment {
    /// Builds an assignment from raw labels, coding levels by first
    /// occurrence.
    pub fn from_labels<S: AsRef<str>>(
        covariate: &str,
        labels: &[S],
    ) -> Self {
        let mut levels: Vec<String> = Vec::new();
        let mut level_index: HashMap<String, usize> = HashMap::new();
        let mut codes = Vec::with_capacity(labels.len());
        for label in labels {
            let label = label.as_ref();
            let code = match level_index.get(label) {
                Some(&code) => code,
                None => {
                    let code = levels.len();
                    levels.push(label.to_string());
                    level_index.insert(label.to_string(), code);
                    code
                },
            };
            codes.push(code);
        }
        Self {
            covariate: covariate.to_string(),
            codes,
            levels,
        }
    }

    pub fn covariate(&self) -> &str { &self.covariate }

    /// Per-spot level codes, `0..n_levels`. Codes index into
    /// [`BatchAssignment::levels`], so any number of distinct labels is
    /// representable.
    pub fn codes(&self) -> &[usize] { &self.codes }

    pub fn levels(&self) -> &[String] { &self.levels }

    pub fn n_levels(&self) -> usize { self.levels.len() }

    pub fn len(&self) -> usize { self.codes.len() }

    pub fn is_empty(&self) -> bool { self.codes.is_empty() }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use polars::df;

    use super::*;

    fn small_matrix() -> CountMatrix {
        CountMatrix::new(
            arr2(&[[1u32, 2, 3], [4, 5, 6]]),
            vec!["g1".into(), "g2".into()],
            None,
            vec!["s1".into(), "s2".into(), "s3".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_dimensions_validated() {
        let res = CountMatrix::new(
            arr2(&[[1u32, 2], [3, 4]]),
            vec!["g1".into()],
            None,
            vec!["s1".into(), "s2".into()],
        );
        assert!(matches!(res, Err(BiasError::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_gene_ids_rejected() {
        let res = CountMatrix::new(
            arr2(&[[1u32, 2], [3, 4]]),
            vec!["g1".into(), "g1".into()],
            None,
            vec!["s1".into(), "s2".into()],
        );
        assert!(matches!(res, Err(BiasError::InvalidInput(_))));
    }

    #[test]
    fn test_spot_totals() {
        let matrix = small_matrix();
        assert_eq!(matrix.spot_totals(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_batch_assignment_from_meta() {
        let meta = df!(
            "sample" => &["A", "B", "A"],
        )
        .unwrap();
        let matrix = small_matrix().with_spot_meta(meta).unwrap();
        let assignment = matrix.batch_assignment("sample").unwrap();
        assert_eq!(assignment.covariate(), "sample");
        assert_eq!(assignment.codes(), &[0, 1, 0]);
        assert_eq!(assignment.levels(), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_batch_assignment_missing_column() {
        let meta = df!("sample" => &["A", "B", "A"]).unwrap();
        let matrix = small_matrix().with_spot_meta(meta).unwrap();
        assert!(matches!(
            matrix.batch_assignment("sex"),
            Err(BiasError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_meta_height_validated() {
        let meta = df!("sample" => &["A", "B"]).unwrap();
        assert!(matches!(
            small_matrix().with_spot_meta(meta),
            Err(BiasError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_labels_first_occurrence_order() {
        let assignment =
            BatchAssignment::from_labels("sex", &["M", "F", "M", "F"]);
        assert_eq!(assignment.codes(), &[0, 1, 0, 1]);
        assert_eq!(assignment.n_levels(), 2);
    }

    #[test]
    fn test_from_labels_many_levels_stay_distinct() {
        let labels = (0..70_000).map(|i| format!("b{}", i)).collect_vec();
        let assignment = BatchAssignment::from_labels("barcode", &labels);
        assert_eq!(assignment.n_levels(), 70_000);
        // Codes keep counting past the u16 range instead of wrapping
        assert_eq!(assignment.codes()[65_535], 65_535);
        assert_eq!(assignment.codes()[65_536], 65_536);
        assert_eq!(assignment.levels()[65_536], "b65536");
    }
}
