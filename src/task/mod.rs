pub mod context;
pub mod handle;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod tree;
pub mod types;

#[cfg(test)]
mod tests;

pub use context::{ContextId, ContextQueue, Envelope, Mutation};
pub use handle::*;
pub use manager::*;
pub use registry::*;
pub use tree::{Effects, TaskTree};
pub use types::*;
