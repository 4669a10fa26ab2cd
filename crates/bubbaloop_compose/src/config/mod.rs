//! Compose file parsing, `.env` loading and variable interpolation

mod compose_file;
mod env_file;
mod interpolation;

pub use compose_file::*;
pub use env_file::*;
pub use interpolation::*;

pub(crate) use compose_file::duration::parse as parse_duration;
