use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("input dimension {dim} ({size}) is not divisible by tensor parallel world size ({world_size})")]
    DimensionMismatch {
        dim: usize,
        size: usize,
        world_size: usize,
    },

    #[error("Parallel group error: {0}")]
    Group(String),

    #[error("Communication error: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;
