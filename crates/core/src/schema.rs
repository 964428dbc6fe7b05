#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    pub target_type: String,
    #[serde(default)]
    pub many: bool,
}

// Storage metadata for one entity type: the natural key (in declaration
// order), an optional alternate key used for matching, the optional
// concurrency token field, and the navigable relations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub type_name: String,
    pub key: Vec<String>,
    #[serde(default)]
    pub alternate_key: Option<Vec<String>>,
    #[serde(default)]
    pub concurrency_token: Option<String>,
    #[serde(default)]
    pub relations: Vec<RelationSchema>,
    #[serde(default)]
    pub required_relations: Vec<String>,
}

impl EntitySchema {
    pub fn relation(&self, name: &str) -> Option<&RelationSchema> {
        self.relations.iter().find(|rel| rel.name == name)
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, schema: EntitySchema) -> Result<(), SchemaError> {
        if schema.type_name.trim().is_empty() {
            return Err(SchemaError::EmptyTypeName);
        }
        if schema.key.is_empty() {
            return Err(SchemaError::EmptyKey {
                type_name: schema.type_name.clone(),
            });
        }
        if let Some(alternate) = &schema.alternate_key {
            if alternate.is_empty() {
                return Err(SchemaError::EmptyKey {
                    type_name: schema.type_name.clone(),
                });
            }
        }
        if self.types.contains_key(&schema.type_name) {
            return Err(SchemaError::DuplicateType {
                type_name: schema.type_name.clone(),
            });
        }

        let mut seen = BTreeSet::new();
        for relation in &schema.relations {
            if !seen.insert(relation.name.as_str()) {
                return Err(SchemaError::DuplicateRelation {
                    type_name: schema.type_name.clone(),
                    relation: relation.name.clone(),
                });
            }
        }
        for required in &schema.required_relations {
            if schema.relation(required).is_none() {
                return Err(SchemaError::UnknownRequiredRelation {
                    type_name: schema.type_name.clone(),
                    relation: required.clone(),
                });
            }
        }

        self.types.insert(schema.type_name.clone(), schema);
        Ok(())
    }

    pub fn define_all(
        &mut self,
        schemas: impl IntoIterator<Item = EntitySchema>,
    ) -> Result<(), SchemaError> {
        for schema in schemas {
            self.define(schema)?;
        }
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&EntitySchema> {
        self.types.get(type_name)
    }

    pub fn expect(&self, type_name: &str) -> Result<&EntitySchema, SchemaError> {
        self.types
            .get(type_name)
            .ok_or_else(|| SchemaError::UnknownType {
                type_name: type_name.to_string(),
            })
    }

    pub fn relation(&self, type_name: &str, relation: &str) -> Result<&RelationSchema, SchemaError> {
        self.expect(type_name)?
            .relation(relation)
            .ok_or_else(|| SchemaError::UnknownRelation {
                type_name: type_name.to_string(),
                relation: relation.to_string(),
            })
    }

    // Cross-type check: every relation must point at a defined type.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for schema in self.types.values() {
            for relation in &schema.relations {
                if !self.types.contains_key(&relation.target_type) {
                    return Err(SchemaError::UnknownTarget {
                        type_name: schema.type_name.clone(),
                        relation: relation.name.clone(),
                        target: relation.target_type.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn types(&self) -> impl Iterator<Item = &EntitySchema> {
        self.types.values()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaError {
    EmptyTypeName,
    EmptyKey { type_name: String },
    DuplicateType { type_name: String },
    DuplicateRelation { type_name: String, relation: String },
    UnknownType { type_name: String },
    UnknownRelation { type_name: String, relation: String },
    UnknownRequiredRelation { type_name: String, relation: String },
    UnknownTarget { type_name: String, relation: String, target: String },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTypeName => write!(f, "entity type name must not be empty"),
            Self::EmptyKey { type_name } => {
                write!(f, "entity type {type_name} must declare a non-empty key")
            }
            Self::DuplicateType { type_name } => {
                write!(f, "entity type {type_name} is already defined")
            }
            Self::DuplicateRelation { type_name, relation } => {
                write!(f, "relation {type_name}.{relation} is declared twice")
            }
            Self::UnknownType { type_name } => write!(f, "unknown entity type {type_name}"),
            Self::UnknownRelation { type_name, relation } => {
                write!(f, "unknown relation {type_name}.{relation}")
            }
            Self::UnknownRequiredRelation { type_name, relation } => {
                write!(
                    f,
                    "required relation {type_name}.{relation} is not a declared relation"
                )
            }
            Self::UnknownTarget {
                type_name,
                relation,
                target,
            } => write!(
                f,
                "relation {type_name}.{relation} targets undefined type {target}"
            ),
        }
    }
}

impl std::error::Error for SchemaError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn company() -> EntitySchema {
        EntitySchema {
            type_name: "Company".to_string(),
            key: vec!["Id".to_string()],
            alternate_key: None,
            concurrency_token: None,
            relations: vec![RelationSchema {
                name: "Contacts".to_string(),
                target_type: "Contact".to_string(),
                many: true,
            }],
            required_relations: Vec::new(),
        }
    }

    #[test]
    fn define_rejects_duplicates_and_empty_keys() {
        let mut registry = SchemaRegistry::new();
        registry.define(company()).unwrap();
        assert_eq!(
            registry.define(company()).unwrap_err(),
            SchemaError::DuplicateType {
                type_name: "Company".to_string()
            }
        );

        let mut empty_key = company();
        empty_key.type_name = "Broken".to_string();
        empty_key.key.clear();
        assert_eq!(
            registry.define(empty_key).unwrap_err(),
            SchemaError::EmptyKey {
                type_name: "Broken".to_string()
            }
        );
    }

    #[test]
    fn validate_requires_relation_targets() {
        let mut registry = SchemaRegistry::new();
        registry.define(company()).unwrap();
        assert_eq!(
            registry.validate().unwrap_err(),
            SchemaError::UnknownTarget {
                type_name: "Company".to_string(),
                relation: "Contacts".to_string(),
                target: "Contact".to_string(),
            }
        );

        registry
            .define(EntitySchema {
                type_name: "Contact".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            })
            .unwrap();
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn required_relations_must_exist() {
        let mut registry = SchemaRegistry::new();
        let mut schema = company();
        schema.required_relations = vec!["Missing".to_string()];
        assert_eq!(
            registry.define(schema).unwrap_err(),
            SchemaError::UnknownRequiredRelation {
                type_name: "Company".to_string(),
                relation: "Missing".to_string(),
            }
        );
    }
}
