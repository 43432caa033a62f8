use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, ValueEnum};
use itertools::Itertools;
use serde::Serialize;
use svgbias::data_structs::BatchAssignment;
use svgbias::io::{read_counts_csv, read_spot_meta_csv, write_bias_frames};
use svgbias::tools::bias::{bias_detect,
                           biased_genes,
                           refine,
                           BiasDetectConfig,
                           BiasScorer,
                           FeatureSelectConfig,
                           MissingPolicy,
                           NsdThreshold,
                           ThresholdKind,
                           ZeroSdPolicy};

use crate::utils::read_gene_list;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ThresholdArg {
    Dev,
    Rank,
    Both,
}

impl From<ThresholdArg> for ThresholdKind {
    fn from(value: ThresholdArg) -> Self {
        match value {
            ThresholdArg::Dev => ThresholdKind::Dev,
            ThresholdArg::Rank => ThresholdKind::Rank,
            ThresholdArg::Both => ThresholdKind::Both,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DetectArgs {
    /// Counts CSV (gene id column + one column per spot)
    #[arg(short, long)]
    pub counts: PathBuf,

    /// Spot metadata CSV, rows in matrix spot order
    #[arg(short, long)]
    pub meta: PathBuf,

    /// Covariate column names to test, e.g. -b sample -b sex
    #[arg(short = 'b', long = "covariate", required = true)]
    pub covariates: Vec<String>,

    /// Name of the gene id column
    #[arg(long, default_value = "gene_id")]
    pub gene_col: String,

    /// Name of an optional gene display-name column
    #[arg(long)]
    pub name_col: Option<String>,

    /// Candidate gene list file, one id per line (default: every gene in the
    /// matrix)
    #[arg(short, long)]
    pub genes: Option<PathBuf>,

    /// Which nSD column(s) to threshold
    #[arg(short, long, value_enum, default_value_t = ThresholdArg::Both)]
    pub threshold: ThresholdArg,

    /// Deviance nSD threshold(s): one value, or one per covariate
    #[arg(long = "nsd-dev", num_args = 1.., value_delimiter = ',', default_values_t = [2.0])]
    pub nsd_dev: Vec<f64>,

    /// Rank nSD threshold(s): one value, or one per covariate
    #[arg(long = "nsd-rank", num_args = 1.., value_delimiter = ',', default_values_t = [2.0])]
    pub nsd_rank: Vec<f64>,

    /// Drop candidate genes absent from the matrix instead of failing
    #[arg(long)]
    pub intersect: bool,

    /// Fail on zero-spread nSD columns instead of flattening them to 0
    #[arg(long)]
    pub strict_zero_sd: bool,

    /// Directory for the per-covariate tables
    #[arg(short, long)]
    pub out_dir: PathBuf,

    /// Print the flagged/kept gene lists as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct DetectSummary {
    covariates: Vec<String>,
    n_candidates: usize,
    biased: Vec<String>,
    kept: Vec<String>,
}

fn to_threshold(values: &[f64]) -> NsdThreshold {
    if values.len() == 1 {
        NsdThreshold::Global(values[0])
    }
    else {
        NsdThreshold::PerCovariate(values.to_vec())
    }
}

impl DetectArgs {
    pub fn run(&self) -> anyhow::Result<()> {
        let matrix = read_counts_csv(
            &self.counts,
            &self.gene_col,
            self.name_col.as_deref(),
        )?;
        let meta = read_spot_meta_csv(&self.meta)?;
        let matrix = matrix.with_spot_meta(meta)?;

        let candidates = match &self.genes {
            Some(path) => read_gene_list(path)?,
            None => matrix.gene_ids().to_vec(),
        };
        let assignments: Vec<BatchAssignment> = self
            .covariates
            .iter()
            .map(|name| matrix.batch_assignment(name))
            .collect::<Result<_, _>>()?;

        let select_config = FeatureSelectConfig {
            missing_candidates: if self.intersect {
                MissingPolicy::Intersect
            }
            else {
                MissingPolicy::Error
            },
            zero_sd: if self.strict_zero_sd {
                ZeroSdPolicy::Error
            }
            else {
                ZeroSdPolicy::Flatten
            },
        };
        let detect_config = BiasDetectConfig {
            threshold: self.threshold.into(),
            nsd_dev:   to_threshold(&self.nsd_dev),
            nsd_rank:  to_threshold(&self.nsd_rank),
        };

        let scorer = BiasScorer::new(&matrix);
        let frames =
            scorer.feature_select(&candidates, &assignments, &select_config)?;
        let frames = bias_detect(frames, &detect_config)?;
        write_bias_frames(&frames, &self.out_dir)?;

        let biased = biased_genes(&frames)?;
        let kept = refine(&candidates, &biased);

        if self.json {
            let summary = DetectSummary {
                covariates: self.covariates.clone(),
                n_candidates: candidates.len(),
                biased,
                kept,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&summary)
                    .context("could not serialize summary")?
            );
        }
        else {
            println!(
                "Flagged {} of {} candidate gene(s) across {}",
                biased.len(),
                candidates.len(),
                self.covariates.iter().join(", ")
            );
            for gene_id in &biased {
                println!("  - {}", gene_id);
            }
            println!("{} gene(s) kept", kept.len());
        }
        Ok(())
    }
}
