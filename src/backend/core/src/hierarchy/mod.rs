//! Character → corporation → alliance hierarchy.
//!
//! - [`CharacterDirectory`]: where character ownership is stored
//! - [`HierarchyResolver`]: cached expansion of a user into a [`HierarchyContext`]

mod directory;
mod models;
mod resolver;

pub use directory::{CharacterDirectory, InMemoryDirectory};
pub use models::{CharacterHierarchy, CharacterRecord, HierarchyContext, ResolutionError};
pub use resolver::HierarchyResolver;
