#![forbid(unsafe_code)]

pub mod context;
pub mod identity;
pub mod mapping;
pub mod schema;
pub mod value;

pub use context::{EntityRef, IncludePath, LoadMode, PersistenceContext, StoreError};
pub use identity::{EntityIdentity, IdentityError, IdentityResolver};
pub use mapping::{MappingError, MappingNode, MappingTree, NodeKind};
pub use schema::{EntitySchema, RelationSchema, SchemaError, SchemaRegistry};
pub use value::{Entity, RelationValue, Scalar};
