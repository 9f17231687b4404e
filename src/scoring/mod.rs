pub mod client;
pub mod error;
pub mod parse;
pub mod types;

pub use client::{ClientSettings, ScoreService, ScoringClient};
pub use error::ScoringError;
pub use parse::{ScoreResult, ValidationError, parse_result};
pub use types::{Completion, ImagePayload, Usage};
