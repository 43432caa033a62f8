pub mod bias;
pub mod deviance;
