//! Input containers and output tables for the bias-scoring pipeline.

pub mod bias_frame;
pub mod counts;

pub use bias_frame::{BiasFrame, GeneRecord};
pub use counts::{BatchAssignment, CountMatrix};
