pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use error::{ConveyorError, Result};
pub use ids::*;
