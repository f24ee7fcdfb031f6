pub mod config;
pub mod engine;
pub mod error;
pub mod utils;
pub mod workflow;

pub use config::Config;
pub use engine::SequenceEngine;
pub use error::AppError;
