//! Runtime components for service supervision

pub mod gate;
pub mod graph;
pub mod health;
pub mod plan;
pub mod probe;
pub mod process;
pub mod spec;
pub mod state;
pub mod supervisor;

pub use gate::*;
pub use graph::*;
pub use health::*;
pub use plan::*;
pub use probe::*;
pub use process::*;
pub use spec::*;
pub use state::*;
pub use supervisor::*;
