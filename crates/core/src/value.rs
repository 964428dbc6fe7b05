#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }

    // Unset-or-default, used when deciding whether a natural key is assigned yet.
    pub fn is_unset(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(_) => false,
            Self::Int(value) => *value == 0,
            Self::Float(value) => *value == 0.0,
            Self::Text(value) => value.is_empty(),
            Self::Bytes(value) => value.is_empty(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Text(_) => 4,
            Self::Bytes(_) => 5,
        }
    }

    // Total order over key component values. Floats compare by total_cmp and
    // byte values by byte sequence, so identities are usable as map keys.
    pub fn key_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn key_eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }

    pub(crate) fn key_hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(value) => value.hash(state),
            Self::Int(value) => value.hash(state),
            Self::Float(value) => value.to_bits().hash(state),
            Self::Text(value) => value.hash(state),
            Self::Bytes(value) => value.hash(state),
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Bytes(value) => {
                write!(f, "0x")?;
                for byte in value {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationValue {
    One(Option<Box<Entity>>),
    Many(Vec<Entity>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub type_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Scalar>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationValue>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Scalar) -> &mut Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Scalar) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    // Single-valued relation access. An absent relation and an explicit
    // One(None) both read as "no value".
    pub fn one(&self, relation: &str) -> Option<&Entity> {
        match self.relations.get(relation) {
            Some(RelationValue::One(Some(child))) => Some(child),
            _ => None,
        }
    }

    pub fn one_mut(&mut self, relation: &str) -> Option<&mut Entity> {
        match self.relations.get_mut(relation) {
            Some(RelationValue::One(Some(child))) => Some(child),
            _ => None,
        }
    }

    pub fn set_one(&mut self, relation: impl Into<String>, child: Option<Entity>) -> &mut Self {
        self.relations
            .insert(relation.into(), RelationValue::One(child.map(Box::new)));
        self
    }

    pub fn with_one(mut self, relation: impl Into<String>, child: Option<Entity>) -> Self {
        self.set_one(relation, child);
        self
    }

    // Collection relation access. An absent relation and One(...) read as an
    // empty collection; the merge treats a null incoming collection as empty.
    pub fn many(&self, relation: &str) -> &[Entity] {
        match self.relations.get(relation) {
            Some(RelationValue::Many(items)) => items,
            _ => &[],
        }
    }

    pub fn take_many(&mut self, relation: &str) -> Vec<Entity> {
        match self.relations.remove(relation) {
            Some(RelationValue::Many(items)) => items,
            Some(other) => {
                self.relations.insert(relation.to_string(), other);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    pub fn set_many(&mut self, relation: impl Into<String>, items: Vec<Entity>) -> &mut Self {
        self.relations
            .insert(relation.into(), RelationValue::Many(items));
        self
    }

    pub fn with_many(mut self, relation: impl Into<String>, items: Vec<Entity>) -> Self {
        self.set_many(relation, items);
        self
    }
}
