use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use hashbrown::HashSet;
use log::info;
use polars::prelude::*;

use crate::data_structs::bias_frame::BiasFrame;
use crate::tools::deviance::DevianceRanking;

/// Writes one `<covariate>.csv` per frame into `dir`, creating the directory
/// if needed. Returns the written paths in frame order. Covariate names must
/// be unique; a repeated name would overwrite an earlier table, so it fails
/// before anything is written.
pub fn write_bias_frames<P: AsRef<Path>>(
    frames: &[BiasFrame],
    dir: P,
) -> anyhow::Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut seen = HashSet::with_capacity(frames.len());
    for frame in frames {
        if !seen.insert(frame.covariate()) {
            bail!(
                "duplicate covariate name '{}': refusing to overwrite {}",
                frame.covariate(),
                dir.join(format!("{}.csv", frame.covariate())).display()
            );
        }
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("could not create {}", dir.display()))?;

    let mut paths = Vec::with_capacity(frames.len());
    for frame in frames {
        let path = dir.join(format!("{}.csv", frame.covariate()));
        frame.write_csv_path(&path).with_context(|| {
            format!("could not write table to {}", path.display())
        })?;
        info!(
            "Wrote {} row(s) for covariate '{}' to {}",
            frame.height(),
            frame.covariate(),
            path.display()
        );
        paths.push(path);
    }
    Ok(paths)
}

/// Writes a deviance ranking to a CSV file at `path`.
pub fn write_ranking_csv<P: AsRef<Path>>(
    ranking: &DevianceRanking,
    path: P,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut data = ranking.to_data_frame()?;
    let file = std::fs::File::create(path)
        .with_context(|| format!("could not create {}", path.display()))?;
    CsvWriter::new(file)
        .include_header(true)
        .finish(&mut data)
        .with_context(|| format!("could not write ranking to {}", path.display()))?;
    info!("Wrote {} ranked gene(s) to {}", ranking.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use polars::df;

    use super::*;

    fn single_row_frame(covariate: &str) -> BiasFrame {
        let data = df!(
            "gene_id" => &["g1"],
            "gene_name" => &["G1"],
            "dev_nobatch" => &[10.0f64],
            "dev_batch" => &[8.0f64],
            "rel_change_dev" => &[0.2f64],
            "rank_nobatch" => &[1u32],
            "rank_batch" => &[1u32],
            "rank_diff" => &[0i32],
            "nSD_dev" => &[0.0f64],
            "nSD_rank" => &[0.0f64],
            "fit_ok" => &[true],
            "dev_outlier" => &[false],
            "rank_outlier" => &[false],
        )
        .unwrap();
        BiasFrame::try_new(covariate, data).unwrap()
    }

    #[test]
    fn test_write_bias_frames() {
        let dir = tempfile::tempdir().unwrap();
        let paths =
            write_bias_frames(&[single_row_frame("sample")], dir.path())
                .unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("sample.csv"));
        let contents = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(contents.starts_with("gene_id,"));
    }

    #[test]
    fn test_duplicate_covariate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let frames =
            [single_row_frame("sample"), single_row_frame("sample")];
        assert!(write_bias_frames(&frames, dir.path()).is_err());
        // Failure comes before any file is written
        assert!(!dir.path().join("sample.csv").exists());
    }
}
