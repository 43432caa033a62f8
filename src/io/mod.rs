//! CSV loading of count matrices and spot metadata, CSV output of result
//! tables. Everything here is an explicit, separate step: the scoring logic
//! itself never touches the filesystem.

mod read;
mod write;

pub use read::{read_counts_csv, read_spot_meta_csv};
pub use write::{write_bias_frames, write_ranking_csv};
