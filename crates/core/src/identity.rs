#![forbid(unsafe_code)]

use crate::schema::SchemaRegistry;
use crate::value::{Entity, Scalar};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// Structural identity: the ordered key component values of one entity
// instance. Components carry their field names so composite keys from
// different types never collide by accident.
#[derive(Clone, Debug)]
pub struct EntityIdentity {
    components: Vec<(String, Scalar)>,
}

impl EntityIdentity {
    pub fn new(components: Vec<(String, Scalar)>) -> Result<Self, IdentityError> {
        if components.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self { components })
    }

    pub fn components(&self) -> &[(String, Scalar)] {
        &self.components
    }

    // True when no component carries an assigned value, i.e. the natural key
    // has not been set yet (new instance awaiting a generated key).
    pub fn is_unset(&self) -> bool {
        self.components.iter().all(|(_, value)| value.is_unset())
    }

    // A reference-only entity carrying just the key fields. Used for cyclic
    // back-references so the reconciled in-memory tree stays acyclic.
    pub fn to_stub(&self, type_name: &str) -> Entity {
        let mut stub = Entity::new(type_name);
        for (name, value) in &self.components {
            stub.set_field(name.clone(), value.clone());
        }
        stub
    }
}

impl PartialEq for EntityIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EntityIdentity {}

impl Ord for EntityIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((name_a, value_a), (name_b, value_b)) in
            self.components.iter().zip(other.components.iter())
        {
            match name_a.cmp(name_b) {
                Ordering::Equal => {}
                order => return order,
            }
            match value_a.key_cmp(value_b) {
                Ordering::Equal => {}
                order => return order,
            }
        }
        self.components.len().cmp(&other.components.len())
    }
}

impl PartialOrd for EntityIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for EntityIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (name, value) in &self.components {
            name.hash(state);
            value.key_hash(state);
        }
    }
}

impl std::fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (index, (name, value)) in self.components.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityError {
    Empty,
    UnknownType(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "identity must have at least one component"),
            Self::UnknownType(type_name) => {
                write!(f, "no schema defined for entity type {type_name}")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Clone, Debug)]
pub struct IdentityResolver {
    schemas: Arc<SchemaRegistry>,
}

impl IdentityResolver {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    // Natural key, in metadata declaration order. A key field missing from
    // the instance resolves to a Null component (unset, never matching an
    // assigned key).
    pub fn identity_of(&self, entity: &Entity) -> Result<EntityIdentity, IdentityError> {
        let schema = self
            .schemas
            .get(&entity.type_name)
            .ok_or_else(|| IdentityError::UnknownType(entity.type_name.clone()))?;
        project(entity, &schema.key)
    }

    // Matching identity: the alternate key when one is configured for the
    // type, the natural key otherwise. Alternate keys take precedence for
    // matching but never replace the natural key for storage addressing.
    pub fn matching_identity_of(&self, entity: &Entity) -> Result<EntityIdentity, IdentityError> {
        let schema = self
            .schemas
            .get(&entity.type_name)
            .ok_or_else(|| IdentityError::UnknownType(entity.type_name.clone()))?;
        match &schema.alternate_key {
            Some(alternate) => project(entity, alternate),
            None => project(entity, &schema.key),
        }
    }

    // Absent instances have no identity: None never equals anything,
    // including None vs None.
    pub fn identities_equal(a: Option<&EntityIdentity>, b: Option<&EntityIdentity>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a == b)
    }
}

fn project(entity: &Entity, fields: &[String]) -> Result<EntityIdentity, IdentityError> {
    let components = fields
        .iter()
        .map(|field| {
            (
                field.clone(),
                entity.field(field).cloned().unwrap_or(Scalar::Null),
            )
        })
        .collect();
    EntityIdentity::new(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntitySchema;

    fn registry() -> Arc<SchemaRegistry> {
        let mut schemas = SchemaRegistry::new();
        schemas
            .define(EntitySchema {
                type_name: "Contact".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: Some(vec!["FirstName".to_string(), "LastName".to_string()]),
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            })
            .unwrap();
        Arc::new(schemas)
    }

    #[test]
    fn natural_and_alternate_keys() {
        let resolver = IdentityResolver::new(registry());
        let contact = Entity::new("Contact")
            .with_field("Id", Scalar::Int(3))
            .with_field("FirstName", Scalar::Text("Tim".to_string()))
            .with_field("LastName", Scalar::Text("Jones".to_string()));

        let natural = resolver.identity_of(&contact).unwrap();
        assert_eq!(natural.to_string(), "(Id=3)");

        let matching = resolver.matching_identity_of(&contact).unwrap();
        assert_eq!(matching.to_string(), "(FirstName=Tim, LastName=Jones)");
    }

    #[test]
    fn missing_key_field_is_unset() {
        let resolver = IdentityResolver::new(registry());
        let contact = Entity::new("Contact");
        let identity = resolver.identity_of(&contact).unwrap();
        assert!(identity.is_unset());
    }

    #[test]
    fn none_is_never_equal() {
        let resolver = IdentityResolver::new(registry());
        let a = resolver
            .identity_of(&Entity::new("Contact").with_field("Id", Scalar::Int(1)))
            .unwrap();
        assert!(!IdentityResolver::identities_equal(None, None));
        assert!(!IdentityResolver::identities_equal(Some(&a), None));
        assert!(IdentityResolver::identities_equal(Some(&a), Some(&a)));
    }

    #[test]
    fn identity_ordering_is_stable() {
        let one = EntityIdentity::new(vec![("Id".to_string(), Scalar::Int(1))]).unwrap();
        let two = EntityIdentity::new(vec![("Id".to_string(), Scalar::Int(2))]).unwrap();
        assert!(one < two);
        assert_ne!(one, two);

        let binary_a =
            EntityIdentity::new(vec![("Key".to_string(), Scalar::Bytes(vec![1, 2]))]).unwrap();
        let binary_b =
            EntityIdentity::new(vec![("Key".to_string(), Scalar::Bytes(vec![1, 2]))]).unwrap();
        assert_eq!(binary_a, binary_b);
    }
}
