#![forbid(unsafe_code)]

use crate::identity::EntityIdentity;
use crate::value::Entity;

// Dotted relation path used for eager loading, e.g. "Contacts.Infos".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IncludePath(Vec<String>);

impl IncludePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self(
            segments
                .into_iter()
                .filter(|segment| !segment.trim().is_empty())
                .collect(),
        )
    }

    pub fn from_dotted(path: &str) -> Self {
        Self::new(path.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for IncludePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

// (type, identity) address of a stored instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub type_name: String,
    pub identity: EntityIdentity,
}

impl EntityRef {
    pub fn new(type_name: impl Into<String>, identity: EntityIdentity) -> Self {
        Self {
            type_name: type_name.into(),
            identity,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.type_name, self.identity)
    }
}

// How eager loading issues its queries: one pass per depth level covering
// every relation at that level, or one pass per include path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    Batched,
    PerPath,
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Backend(Box<dyn std::error::Error + Send + Sync>),
    InvalidInput(&'static str),
    UnknownType(String),
    UnknownRelation {
        type_name: String,
        relation: String,
    },
    StaleToken {
        type_name: String,
        identity: String,
    },
    KeyNotGenerated {
        type_name: String,
        reason: &'static str,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Backend(err) => write!(f, "backend: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownType(type_name) => write!(f, "unknown entity type {type_name}"),
            Self::UnknownRelation { type_name, relation } => {
                write!(f, "unknown relation {type_name}.{relation}")
            }
            Self::StaleToken { type_name, identity } => write!(
                f,
                "stale concurrency token on {type_name}{identity}"
            ),
            Self::KeyNotGenerated { type_name, reason } => {
                write!(f, "cannot generate key for {type_name}: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

// The storage collaborator consumed by the merge engine. Mutations accumulate
// in the store's current unit of work; begin/commit/rollback stay with the
// caller. `StaleToken` is the wire form of a concurrency conflict.
pub trait PersistenceContext {
    fn find_by_key(
        &mut self,
        type_name: &str,
        identity: &EntityIdentity,
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Option<Entity>, StoreError>;

    // Single existence-lookup query for all identities; the result vector is
    // parallel to the input.
    fn find_many_by_key(
        &mut self,
        type_name: &str,
        identities: &[EntityIdentity],
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Vec<Option<Entity>>, StoreError>;

    // Registers an insert. Assigns a generated key when the natural key is
    // unset, writing it back into the instance.
    fn add(&mut self, entity: &mut Entity) -> Result<(), StoreError>;

    // Deletes the row and cascades through owned links.
    fn remove(&mut self, entity: &EntityRef) -> Result<(), StoreError>;

    // Copies scalar/complex fields from source onto target, verifying the
    // concurrency token first when asked. Identical values record no
    // mutation.
    fn apply_current_values(
        &mut self,
        target: &mut Entity,
        source: &Entity,
        check_token: bool,
    ) -> Result<(), StoreError>;

    // Resolves an associated instance by identity: returns the stored fields
    // when `reload` is set, the caller's fields otherwise. Never mutates an
    // existing row.
    fn attach_and_reload(&mut self, entity: &Entity, reload: bool) -> Result<Entity, StoreError>;

    fn set_link(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        child: Option<&EntityRef>,
        owned: bool,
    ) -> Result<(), StoreError>;

    fn replace_links(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        children: &[EntityRef],
        owned: bool,
    ) -> Result<(), StoreError>;

    // Relations that must be populated before save; merged into the engine's
    // include paths.
    fn required_relations_for(&self, type_name: &str) -> Result<Vec<IncludePath>, StoreError>;

    fn is_tracked(&self, type_name: &str, identity: &EntityIdentity) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_path_parsing() {
        let path = IncludePath::from_dotted("Contacts.Infos");
        assert_eq!(path.segments(), ["Contacts".to_string(), "Infos".to_string()]);
        assert_eq!(path.depth(), 2);
        assert_eq!(path.to_string(), "Contacts.Infos");
        assert!(IncludePath::from_dotted("").is_empty());
        assert!(IncludePath::new(vec![" ".to_string()]).is_empty());
    }
}
