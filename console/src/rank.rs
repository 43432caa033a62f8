use std::path::PathBuf;

use clap::Args;
use svgbias::io::{read_counts_csv, write_ranking_csv};
use svgbias::tools::bias::BiasScorer;

use crate::utils::read_gene_list;

#[derive(Args, Debug, Clone)]
pub struct RankArgs {
    /// Counts CSV (gene id column + one column per spot)
    #[arg(short, long)]
    pub counts: PathBuf,

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

    /// Output CSV path
    #[arg(short, long)]
    pub output: PathBuf,
}

impl RankArgs {
    pub fn run(&self) -> anyhow::Result<()> {
        let matrix = read_counts_csv(
            &self.counts,
            &self.gene_col,
            self.name_col.as_deref(),
        )?;
        let candidates = match &self.genes {
            Some(path) => read_gene_list(path)?,
            None => matrix.gene_ids().to_vec(),
        };

        let scorer = BiasScorer::new(&matrix);
        let ranking = scorer.compute_baseline(&candidates)?;
        write_ranking_csv(&ranking, &self.output)?;

        let n_failed =
            ranking.fit_ok().iter().filter(|ok| !**ok).count();
        println!(
            "Ranked {} gene(s) ({} failed fit(s)) -> {}",
            ranking.len(),
            n_failed,
            self.output.display()
        );
        Ok(())
    }
}
