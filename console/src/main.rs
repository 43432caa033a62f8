mod detect;
mod rank;
mod utils;

use clap::{Parser, Subcommand};
use detect::DetectArgs;
use rank::RankArgs;
use utils::UtilsArgs;
use wild::ArgsOs;

#[derive(Parser, Debug)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None,)]
struct Cli {
    #[command(subcommand)]
    command: MainMenu,
}

#[derive(Subcommand, Debug)]
enum MainMenu {
    /// Rank candidate genes by unbatched binomial null deviance
    Rank {
        #[clap(flatten)]
        utils: UtilsArgs,
        #[clap(flatten)]
        args:  RankArgs,
    },

    /// Score batch covariates, flag outlier genes and refine the candidate
    /// set
    Detect {
        #[clap(flatten)]
        utils: UtilsArgs,
        #[clap(flatten)]
        args:  DetectArgs,
    },
}

fn main() -> anyhow::Result<()> {
    let args: ArgsOs = wild::args_os();
    let cli = Cli::parse_from(args);

    match cli.command {
        MainMenu::Rank { utils, args } => {
            utils.setup()?;
            args.run()?;
        },
        MainMenu::Detect { utils, args } => {
            utils.setup()?;
            args.run()?;
        },
    }
    Ok(())
}
