#![forbid(unsafe_code)]

use crate::context::IncludePath;
use crate::schema::SchemaRegistry;

// The closed set of relation node kinds. The aggregate root is represented by
// the tree itself; every nested relation is one of these four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    OwnedEntity,
    AssociatedEntity,
    OwnedCollection,
    AssociatedCollection,
}

impl NodeKind {
    pub fn for_relation(owned: bool, many: bool) -> Self {
        match (owned, many) {
            (true, false) => Self::OwnedEntity,
            (false, false) => Self::AssociatedEntity,
            (true, true) => Self::OwnedCollection,
            (false, true) => Self::AssociatedCollection,
        }
    }

    pub fn is_owned(self) -> bool {
        matches!(self, Self::OwnedEntity | Self::OwnedCollection)
    }

    pub fn is_collection(self) -> bool {
        matches!(self, Self::OwnedCollection | Self::AssociatedCollection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OwnedEntity => "owned entity",
            Self::AssociatedEntity => "associated entity",
            Self::OwnedCollection => "owned collection",
            Self::AssociatedCollection => "associated collection",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingNode {
    pub accessor: String,
    pub target_type: String,
    pub kind: NodeKind,
    pub back_reference: Option<String>,
    pub children: Vec<MappingNode>,
}

// Built once per (root type, scheme), immutable thereafter, shared behind an
// Arc by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingTree {
    pub root_type: String,
    pub children: Vec<MappingNode>,
}

impl MappingTree {
    // Eager-load paths for every mapped relation, depth-first, parents before
    // their children.
    pub fn include_paths(&self) -> Vec<IncludePath> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        collect_paths(&self.children, &mut prefix, &mut out);
        out
    }
}

fn collect_paths(nodes: &[MappingNode], prefix: &mut Vec<String>, out: &mut Vec<IncludePath>) {
    for node in nodes {
        prefix.push(node.accessor.clone());
        out.push(IncludePath::new(prefix.clone()));
        collect_paths(&node.children, prefix, out);
        prefix.pop();
    }
}

// Resolves a relation declaration against the schema and enforces the
// cardinality invariant: an entity declaration must map a single-valued
// relation and a collection declaration a multi-valued one. Violations are
// construction-time usage errors.
pub fn relation_target(
    schemas: &SchemaRegistry,
    parent_type: &str,
    accessor: &str,
    declared_collection: bool,
) -> Result<String, MappingError> {
    let schema = schemas
        .get(parent_type)
        .ok_or_else(|| MappingError::UnknownType {
            type_name: parent_type.to_string(),
        })?;
    let relation = schema
        .relation(accessor)
        .ok_or_else(|| MappingError::UnknownRelation {
            type_name: parent_type.to_string(),
            property: accessor.to_string(),
        })?;
    if relation.many && !declared_collection {
        return Err(MappingError::CollectionDeclaredAsEntity {
            type_name: parent_type.to_string(),
            property: accessor.to_string(),
        });
    }
    if !relation.many && declared_collection {
        return Err(MappingError::EntityDeclaredAsCollection {
            type_name: parent_type.to_string(),
            property: accessor.to_string(),
        });
    }
    Ok(relation.target_type.clone())
}

// Validates an explicit child-to-parent back-reference, or infers one when
// exactly one single-valued relation on the child targets the parent type.
// Several candidates without an explicit path is an error rather than a
// name-matching guess.
pub fn resolve_back_reference(
    schemas: &SchemaRegistry,
    child_type: &str,
    parent_type: &str,
    explicit: Option<&str>,
) -> Result<Option<String>, MappingError> {
    let schema = schemas
        .get(child_type)
        .ok_or_else(|| MappingError::UnknownType {
            type_name: child_type.to_string(),
        })?;

    if let Some(path) = explicit {
        let relation =
            schema
                .relation(path)
                .ok_or_else(|| MappingError::UnknownBackReference {
                    child_type: child_type.to_string(),
                    property: path.to_string(),
                })?;
        if relation.many {
            return Err(MappingError::BackReferenceIsCollection {
                child_type: child_type.to_string(),
                property: path.to_string(),
            });
        }
        if relation.target_type != parent_type {
            return Err(MappingError::BackReferenceWrongTarget {
                child_type: child_type.to_string(),
                property: path.to_string(),
                expected: parent_type.to_string(),
                actual: relation.target_type.clone(),
            });
        }
        return Ok(Some(path.to_string()));
    }

    let mut candidates = schema
        .relations
        .iter()
        .filter(|relation| !relation.many && relation.target_type == parent_type);
    match (candidates.next(), candidates.next()) {
        (None, _) => Ok(None),
        (Some(only), None) => Ok(Some(only.name.clone())),
        (Some(_), Some(_)) => Err(MappingError::AmbiguousBackReference {
            child_type: child_type.to_string(),
            parent_type: parent_type.to_string(),
        }),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingError {
    UnknownType {
        type_name: String,
    },
    UnknownRelation {
        type_name: String,
        property: String,
    },
    CollectionDeclaredAsEntity {
        type_name: String,
        property: String,
    },
    EntityDeclaredAsCollection {
        type_name: String,
        property: String,
    },
    NestedUnderAssociated {
        type_name: String,
        property: String,
    },
    UnknownBackReference {
        child_type: String,
        property: String,
    },
    BackReferenceIsCollection {
        child_type: String,
        property: String,
    },
    BackReferenceWrongTarget {
        child_type: String,
        property: String,
        expected: String,
        actual: String,
    },
    AmbiguousBackReference {
        child_type: String,
        parent_type: String,
    },
    OwnedCycle {
        type_name: String,
    },
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownType { type_name } => write!(f, "unknown entity type {type_name}"),
            Self::UnknownRelation { type_name, property } => {
                write!(f, "unknown relation {type_name}.{property}")
            }
            Self::CollectionDeclaredAsEntity { type_name, property } => write!(
                f,
                "{type_name}.{property} is a collection; declare it as a collection relation"
            ),
            Self::EntityDeclaredAsCollection { type_name, property } => write!(
                f,
                "{type_name}.{property} is single-valued; declare it as an entity relation"
            ),
            Self::NestedUnderAssociated { type_name, property } => write!(
                f,
                "{type_name}.{property} is associated and does not cascade; nested mappings are not allowed beneath it"
            ),
            Self::UnknownBackReference { child_type, property } => {
                write!(f, "back-reference {child_type}.{property} does not exist")
            }
            Self::BackReferenceIsCollection { child_type, property } => {
                write!(f, "back-reference {child_type}.{property} must be single-valued")
            }
            Self::BackReferenceWrongTarget {
                child_type,
                property,
                expected,
                actual,
            } => write!(
                f,
                "back-reference {child_type}.{property} targets {actual}, expected {expected}"
            ),
            Self::AmbiguousBackReference {
                child_type,
                parent_type,
            } => write!(
                f,
                "{child_type} has several single-valued relations targeting {parent_type}; declare the back-reference explicitly"
            ),
            Self::OwnedCycle { type_name } => write!(
                f,
                "{type_name} owns an instance of itself (directly or transitively); owned relations must not form a cycle"
            ),
        }
    }
}

impl std::error::Error for MappingError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, RelationSchema};

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .define(EntitySchema {
                type_name: "Company".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: vec![
                    RelationSchema {
                        name: "Contacts".to_string(),
                        target_type: "Contact".to_string(),
                        many: true,
                    },
                    RelationSchema {
                        name: "HeadOffice".to_string(),
                        target_type: "Address".to_string(),
                        many: false,
                    },
                ],
                required_relations: Vec::new(),
            })
            .unwrap();
        registry
            .define(EntitySchema {
                type_name: "Contact".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: vec![RelationSchema {
                    name: "Company".to_string(),
                    target_type: "Company".to_string(),
                    many: false,
                }],
                required_relations: Vec::new(),
            })
            .unwrap();
        registry
            .define(EntitySchema {
                type_name: "Address".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            })
            .unwrap();
        registry
    }

    #[test]
    fn cardinality_mismatch_names_the_property() {
        let schemas = schemas();
        assert_eq!(
            relation_target(&schemas, "Company", "Contacts", false).unwrap_err(),
            MappingError::CollectionDeclaredAsEntity {
                type_name: "Company".to_string(),
                property: "Contacts".to_string(),
            }
        );
        assert_eq!(
            relation_target(&schemas, "Company", "HeadOffice", true).unwrap_err(),
            MappingError::EntityDeclaredAsCollection {
                type_name: "Company".to_string(),
                property: "HeadOffice".to_string(),
            }
        );
        assert_eq!(
            relation_target(&schemas, "Company", "Contacts", true).unwrap(),
            "Contact".to_string()
        );
    }

    #[test]
    fn back_reference_inference() {
        let schemas = schemas();
        assert_eq!(
            resolve_back_reference(&schemas, "Contact", "Company", None).unwrap(),
            Some("Company".to_string())
        );
        assert_eq!(
            resolve_back_reference(&schemas, "Address", "Company", None).unwrap(),
            None
        );
        assert_eq!(
            resolve_back_reference(&schemas, "Contact", "Company", Some("Missing")).unwrap_err(),
            MappingError::UnknownBackReference {
                child_type: "Contact".to_string(),
                property: "Missing".to_string(),
            }
        );
    }

    #[test]
    fn include_paths_are_depth_first() {
        let tree = MappingTree {
            root_type: "Company".to_string(),
            children: vec![MappingNode {
                accessor: "Contacts".to_string(),
                target_type: "Contact".to_string(),
                kind: NodeKind::OwnedCollection,
                back_reference: None,
                children: vec![MappingNode {
                    accessor: "Infos".to_string(),
                    target_type: "ContactInfo".to_string(),
                    kind: NodeKind::OwnedCollection,
                    back_reference: None,
                    children: Vec::new(),
                }],
            }],
        };
        let paths: Vec<String> = tree
            .include_paths()
            .iter()
            .map(|path| path.to_string())
            .collect();
        assert_eq!(paths, vec!["Contacts".to_string(), "Contacts.Infos".to_string()]);
    }
}
