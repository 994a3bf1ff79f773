pub mod error;
pub mod exchange;
pub mod market;
pub mod search;

pub use error::{Result, SourceError};
