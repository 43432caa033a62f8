use std::path::Path;

use anyhow::Context;
use clap::Args;
use itertools::Itertools;
use log::LevelFilter;

#[derive(Args, Debug, Clone)]
pub struct UtilsArgs {
    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Thread count for covariate scoring (default: all cores)
    #[arg(long)]
    pub threads: Option<usize>,
}

impl UtilsArgs {
    pub fn setup(&self) -> anyhow::Result<()> {
        let level = match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        };
        let _ = pretty_env_logger::formatted_builder()
            .filter_level(level)
            .try_init();
        if let Some(threads) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .context("could not configure thread pool")?;
        }
        Ok(())
    }
}

/// Reads a candidate gene list: one id per line, blank lines skipped.
pub fn read_gene_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read gene list {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect_vec())
}
