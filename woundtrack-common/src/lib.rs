//! Value types shared by the wound measurement pipeline and its consumers.

pub mod history;
pub mod types;

pub use history::{HealingHistory, HistoryError};
pub use types::*;
