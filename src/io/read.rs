use std::path::Path;

use anyhow::{bail, Context};
use itertools::Itertools;
use log::debug;
use ndarray::Array2;
use polars::prelude::*;

use crate::data_structs::counts::CountMatrix;

fn read_csv(path: &Path) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(b',')
                .with_try_parse_dates(false),
        )
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
}

/// Reads a genes × spots count matrix from a headered CSV file.
///
/// `gene_id_col` names the gene-id column and `gene_name_col` an optional
/// display-name column; every remaining column is one spot of non-negative
/// integer counts, in file order.
pub fn read_counts_csv<P: AsRef<Path>>(
    path: P,
    gene_id_col: &str,
    gene_name_col: Option<&str>,
) -> anyhow::Result<CountMatrix> {
    let path = path.as_ref();
    let df = read_csv(path)
        .with_context(|| format!("could not read counts from {}", path.display()))?;

    let id_column = df
        .column(gene_id_col)
        .with_context(|| format!("gene id column '{}' not found", gene_id_col))?
        .cast(&DataType::String)?;
    if id_column.null_count() != 0 {
        bail!("gene id column '{}' contains nulls", gene_id_col);
    }
    let gene_ids = id_column
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect_vec();

    let gene_names = match gene_name_col {
        Some(name_col) => {
            let names = df
                .column(name_col)
                .with_context(|| {
                    format!("gene name column '{}' not found", name_col)
                })?
                .cast(&DataType::String)?;
            Some(
                names
                    .str()?
                    .into_iter()
                    .map(|v| v.unwrap_or_default().to_string())
                    .collect_vec(),
            )
        },
        None => None,
    };

    let meta_cols: Vec<&str> = match gene_name_col {
        Some(name_col) => vec![gene_id_col, name_col],
        None => vec![gene_id_col],
    };
    let spot_ids = df
        .get_column_names()
        .into_iter()
        .map(|name| name.as_str())
        .filter(|name| !meta_cols.contains(name))
        .map(|name| name.to_string())
        .collect_vec();
    if spot_ids.is_empty() {
        bail!("no spot columns found in {}", path.display());
    }

    let n_genes = df.height();
    let n_spots = spot_ids.len();
    let mut counts = Array2::<u32>::zeros((n_genes, n_spots));
    for (col_idx, spot) in spot_ids.iter().enumerate() {
        let column = df
            .column(spot)?
            .cast(&DataType::UInt32)
            .with_context(|| {
                format!("spot column '{}' is not integer counts", spot)
            })?;
        let values = column.u32()?;
        if values.null_count() != 0 {
            bail!(
                "spot column '{}' contains nulls or negative counts",
                spot
            );
        }
        for (row_idx, value) in values.into_iter().enumerate() {
            counts[(row_idx, col_idx)] = value.unwrap_or(0);
        }
    }

    debug!(
        "Read count matrix from {}: {} genes x {} spots",
        path.display(),
        n_genes,
        n_spots
    );
    Ok(CountMatrix::new(counts, gene_ids, gene_names, spot_ids)?)
}

/// Reads a spot-metadata table (covariate label columns) from a headered CSV
/// file. Attach it with [`CountMatrix::with_spot_meta`]; rows must be in the
/// matrix's spot order.
pub fn read_spot_meta_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<DataFrame> {
    let path = path.as_ref();
    read_csv(path).with_context(|| {
        format!("could not read spot metadata from {}", path.display())
    })
}
