//! Per-covariate output table of the scoring pipeline.
//!
//! [`BiasFrame`] wraps a polars [`DataFrame`] with a fixed schema: one row per
//! candidate gene, carrying both deviance fits, the derived relative change
//! and rank shift, their standardized nSD scores and the outlier flags. The
//! frame is produced by `feature_select`, re-flagged by `bias_detect` and
//! never mutated otherwise. [`GeneRecord`] is the typed row view for callers
//! that prefer structs over columns.

use std::io::Write;
use std::path::Path;

use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::BiasError;
use crate::utils::{hashmap_from_arrays, schema_from_arrays};

/// One covariate's gene table.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasFrame {
    covariate: String,
    data:      DataFrame,
}

impl BiasFrame {
    /// Creates a new [`BiasFrame`] without checks.
    ///
    /// # Safety
    ///
    /// * input [`DataFrame`] is expected to follow the schema of
    ///   [`BiasFrame::col_names`]
    pub(crate) fn new_unchecked(
        covariate: &str,
        data: DataFrame,
    ) -> Self {
        Self {
            covariate: covariate.to_string(),
            data,
        }
    }

    /// Returns expected column names of the table
    pub const fn col_names() -> &'static [&'static str] {
        &[
            "gene_id",
            "gene_name",
            "dev_nobatch",
            "dev_batch",
            "rel_change_dev",
            "rank_nobatch",
            "rank_batch",
            "rank_diff",
            "nSD_dev",
            "nSD_rank",
            "fit_ok",
            "dev_outlier",
            "rank_outlier",
        ]
    }

    /// Returns expected types of columns
    pub const fn col_types() -> &'static [DataType] {
        &[
            DataType::String,
            DataType::String,
            DataType::Float64,
            DataType::Float64,
            DataType::Float64,
            DataType::UInt32,
            DataType::UInt32,
            DataType::Int32,
            DataType::Float64,
            DataType::Float64,
            DataType::Boolean,
            DataType::Boolean,
            DataType::Boolean,
        ]
    }

    #[inline(always)]
    pub(crate) const fn gene_id_col() -> &'static str { "gene_id" }

    #[inline(always)]
    pub(crate) const fn nsd_dev_col() -> &'static str { "nSD_dev" }

    #[inline(always)]
    pub(crate) const fn nsd_rank_col() -> &'static str { "nSD_rank" }

    #[inline(always)]
    pub(crate) const fn dev_outlier_col() -> &'static str { "dev_outlier" }

    #[inline(always)]
    pub(crate) const fn rank_outlier_col() -> &'static str { "rank_outlier" }

    /// Returns expected schema of the table
    pub fn schema() -> Schema {
        schema_from_arrays(Self::col_names(), Self::col_types())
    }

    /// Returns expected schema as [PlHashMap]
    pub fn hashmap() -> PlHashMap<&'static str, DataType> {
        hashmap_from_arrays(Self::col_names(), Self::col_types())
    }

    /// Validates an arbitrary [`DataFrame`] against the expected schema.
    ///
    /// Columns are cast to their expected types; nulls are rejected in every
    /// column (missing fit results are NaN, never null).
    pub fn try_new(
        covariate: &str,
        data: DataFrame,
    ) -> Result<Self, BiasError> {
        if data.is_empty() {
            return Err(BiasError::InvalidInput(format!(
                "empty table for covariate '{}'",
                covariate
            )));
        }
        let data_casted = data
            .lazy()
            .cast(Self::hashmap(), true)
            .collect()?;
        for &colname in Self::col_names() {
            if data_casted.column(colname)?.null_count() != 0 {
                return Err(BiasError::InvalidInput(format!(
                    "nulls in column '{}' for covariate '{}'",
                    colname, covariate
                )));
            }
        }
        Ok(Self::new_unchecked(covariate, data_casted))
    }

    pub fn covariate(&self) -> &str { &self.covariate }

    /// Returns reference to inner [DataFrame]
    #[inline]
    pub fn data(&self) -> &DataFrame { &self.data }

    pub fn height(&self) -> usize { self.data.height() }

    pub(crate) fn into_parts(self) -> (String, DataFrame) {
        (self.covariate, self.data)
    }

    /// Gene ids flagged by either outlier column (OR semantics), in table
    /// order.
    pub fn outlier_gene_ids(&self) -> PolarsResult<Vec<String>> {
        let mask = self.data.column(Self::dev_outlier_col())?.bool()?
            | self.data.column(Self::rank_outlier_col())?.bool()?;
        let flagged = self.data.filter(&mask)?;
        Ok(flagged
            .column(Self::gene_id_col())?
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect_vec())
    }

    pub fn n_dev_outliers(&self) -> PolarsResult<usize> {
        Ok(self
            .data
            .column(Self::dev_outlier_col())?
            .bool()?
            .sum()
            .unwrap_or(0) as usize)
    }

    pub fn n_rank_outliers(&self) -> PolarsResult<usize> {
        Ok(self
            .data
            .column(Self::rank_outlier_col())?
            .bool()?
            .sum()
            .unwrap_or(0) as usize)
    }

    /// Extracts typed rows in table order.
    pub fn records(&self) -> PolarsResult<Vec<GeneRecord>> {
        let gene_id = self.data.column("gene_id")?.str()?;
        let gene_name = self.data.column("gene_name")?.str()?;
        let dev_nobatch = self.data.column("dev_nobatch")?.f64()?;
        let dev_batch = self.data.column("dev_batch")?.f64()?;
        let rel_change_dev = self.data.column("rel_change_dev")?.f64()?;
        let rank_nobatch = self.data.column("rank_nobatch")?.u32()?;
        let rank_batch = self.data.column("rank_batch")?.u32()?;
        let rank_diff = self.data.column("rank_diff")?.i32()?;
        let nsd_dev = self.data.column(Self::nsd_dev_col())?.f64()?;
        let nsd_rank = self.data.column(Self::nsd_rank_col())?.f64()?;
        let fit_ok = self.data.column("fit_ok")?.bool()?;
        let dev_outlier = self.data.column(Self::dev_outlier_col())?.bool()?;
        let rank_outlier = self.data.column(Self::rank_outlier_col())?.bool()?;

        Ok((0..self.data.height())
            .map(|i| GeneRecord {
                gene_id:        gene_id.get(i).unwrap_or_default().to_string(),
                gene_name:      gene_name.get(i).unwrap_or_default().to_string(),
                dev_nobatch:    dev_nobatch.get(i).unwrap_or(f64::NAN),
                dev_batch:      dev_batch.get(i).unwrap_or(f64::NAN),
                rel_change_dev: rel_change_dev.get(i).unwrap_or(f64::NAN),
                rank_nobatch:   rank_nobatch.get(i).unwrap_or(0),
                rank_batch:     rank_batch.get(i).unwrap_or(0),
                rank_diff:      rank_diff.get(i).unwrap_or(0),
                nsd_dev:        nsd_dev.get(i).unwrap_or(f64::NAN),
                nsd_rank:       nsd_rank.get(i).unwrap_or(f64::NAN),
                fit_ok:         fit_ok.get(i).unwrap_or(false),
                dev_outlier:    dev_outlier.get(i).unwrap_or(false),
                rank_outlier:   rank_outlier.get(i).unwrap_or(false),
            })
            .collect_vec())
    }

    /// Writes the table to a CSV sink.
    pub fn write_csv<W: Write>(
        &self,
        sink: W,
    ) -> PolarsResult<()> {
        let mut data = self.data.clone();
        CsvWriter::new(sink)
            .include_header(true)
            .finish(&mut data)
    }

    /// Writes the table to a CSV file at `path`.
    pub fn write_csv_path<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> PolarsResult<()> {
        let file = std::fs::File::create(path.as_ref())?;
        self.write_csv(file)
    }
}

/// Typed view of one [`BiasFrame`] row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneRecord {
    pub gene_id:        String,
    pub gene_name:      String,
    pub dev_nobatch:    f64,
    pub dev_batch:      f64,
    pub rel_change_dev: f64,
    pub rank_nobatch:   u32,
    pub rank_batch:     u32,
    pub rank_diff:      i32,
    #[serde(rename = "nSD_dev")]
    pub nsd_dev:        f64,
    #[serde(rename = "nSD_rank")]
    pub nsd_rank:       f64,
    pub fit_ok:         bool,
    pub dev_outlier:    bool,
    pub rank_outlier:   bool,
}

#[cfg(test)]
mod tests {
    use polars::df;

    use super::*;

    fn test_df() -> DataFrame {
        df!(
            "gene_id" => &["g1", "g2"],
            "gene_name" => &["G1", "G2"],
            "dev_nobatch" => &[100.0f64, 50.0],
            "dev_batch" => &[90.0f64, 10.0],
            "rel_change_dev" => &[0.1f64, 0.8],
            "rank_nobatch" => &[1u32, 2],
            "rank_batch" => &[1u32, 2],
            "rank_diff" => &[0i32, 0],
            "nSD_dev" => &[-1.0f64, 1.0],
            "nSD_rank" => &[0.0f64, 0.0],
            "fit_ok" => &[true, true],
            "dev_outlier" => &[false, true],
            "rank_outlier" => &[false, false],
        )
        .unwrap()
    }

    #[test]
    fn test_try_new_accepts_valid() {
        let frame = BiasFrame::try_new("sample", test_df()).unwrap();
        assert_eq!(frame.covariate(), "sample");
        assert_eq!(frame.height(), 2);
    }

    #[test]
    fn test_try_new_rejects_missing_column() {
        let data = test_df().drop("nSD_dev").unwrap();
        assert!(BiasFrame::try_new("sample", data).is_err());
    }

    #[test]
    fn test_outlier_gene_ids_or_semantics() {
        let frame = BiasFrame::try_new("sample", test_df()).unwrap();
        assert_eq!(frame.outlier_gene_ids().unwrap(), vec!["g2".to_string()]);
        assert_eq!(frame.n_dev_outliers().unwrap(), 1);
        assert_eq!(frame.n_rank_outliers().unwrap(), 0);
    }

    #[test]
    fn test_records_round_trip() {
        let frame = BiasFrame::try_new("sample", test_df()).unwrap();
        let records = frame.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].gene_id, "g2");
        assert_eq!(records[1].rank_nobatch, 2);
        assert!(records[1].dev_outlier);
        assert!(!records[1].rank_outlier);
    }
}
