#![forbid(unsafe_code)]

pub mod builder;
pub mod error;
pub mod markers;
pub mod merge;
pub mod options;
pub mod registry;

pub use builder::{MappingBuilder, RelationDecl, associated, associated_many, owned, owned_many};
pub use error::{MergeError, UsageError};
pub use markers::{MarkerTable, Ownership, RelationMarker};
pub use merge::MergeEngine;
pub use options::{DuplicatePolicy, MergeOptions};
pub use registry::{DEFAULT_SCHEME, MappingRegistry};
