//! # svgbias
//!
//! Batch-bias detection for binomial-deviance feature selection in spatial
//! transcriptomics.
//!
//! Given a genes × spots count matrix, a candidate list of spatially variable
//! genes (SVGs) and one or more batch covariates (sample, sex, subject), this
//! crate fits per-gene binomial null deviances with and without the covariate,
//! ranks genes by deviance on each side, standardizes the relative deviance
//! change and the rank shift into nSD scores per covariate, and flags genes
//! whose scores exceed caller-supplied thresholds. Flagged genes are suspected
//! of being driven by the batch covariate rather than true spatial biology and
//! can be removed from the candidate set with [`tools::bias::refine`].
//!
//! The pipeline is a pure, one-shot transform: Input → Baseline → Batched
//! (per covariate) → Joined/Standardized → Flagged → Refined. There is no
//! shared session state; every step takes explicit inputs and returns
//! explicit outputs.
//!
//! ## Module organization
//!
//! - [`data_structs`]: validated input containers ([`data_structs::CountMatrix`],
//!   [`data_structs::BatchAssignment`]) and the per-covariate output table
//!   ([`data_structs::BiasFrame`])
//! - [`tools::deviance`]: the deviance-fitting seam and the closed-form
//!   binomial implementation
//! - [`tools::bias`]: baseline/batched scoring, outlier flagging and
//!   candidate refinement
//! - [`io`]: CSV loading of count matrices and spot metadata, CSV output of
//!   result tables

pub mod data_structs;
pub mod error;
pub mod exports;
pub mod io;
pub mod tools;
pub mod utils;
