#![allow(dead_code)]

use gm_core::{
    Entity, EntityIdentity, EntitySchema, RelationSchema, Scalar, SchemaRegistry,
};
use gm_engine::{
    DEFAULT_SCHEME, MappingBuilder, MappingRegistry, MergeEngine, MergeOptions, associated,
    associated_many, owned, owned_many,
};
use gm_storage::SqliteStore;
use std::sync::Arc;

pub fn schemas() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry
        .define_all([
            EntitySchema {
                type_name: "Company".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: Some("Version".to_string()),
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
                    RelationSchema {
                        name: "Auditor".to_string(),
                        target_type: "Manager".to_string(),
                        many: false,
                    },
                    RelationSchema {
                        name: "Stakeholders".to_string(),
                        target_type: "Manager".to_string(),
                        many: true,
                    },
                ],
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "Contact".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: Some(vec!["Email".to_string()]),
                concurrency_token: None,
                relations: vec![
                    RelationSchema {
                        name: "Company".to_string(),
                        target_type: "Company".to_string(),
                        many: false,
                    },
                    RelationSchema {
                        name: "Infos".to_string(),
                        target_type: "ContactInfo".to_string(),
                        many: true,
                    },
                ],
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "ContactInfo".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: Some(vec!["Value".to_string()]),
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "Address".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: Some("Version".to_string()),
                relations: Vec::new(),
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "Manager".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: vec![RelationSchema {
                    name: "Company".to_string(),
                    target_type: "Company".to_string(),
                    many: false,
                }],
                required_relations: Vec::new(),
            },
        ])
        .unwrap();
    registry.validate().unwrap();
    Arc::new(registry)
}

pub fn registry() -> Arc<MappingRegistry> {
    let registry = Arc::new(MappingRegistry::new(schemas()));
    let tree = MappingBuilder::for_root("Company")
        .relation(owned_many("Contacts").child(owned_many("Infos")))
        .relation(owned("HeadOffice"))
        .relation(associated("Auditor"))
        .relation(associated_many("Stakeholders"))
        .build(registry.schemas())
        .unwrap();
    registry.register(DEFAULT_SCHEME, tree);
    registry
}

pub fn engine() -> MergeEngine {
    MergeEngine::new(registry())
}

pub fn engine_with(options: MergeOptions) -> MergeEngine {
    MergeEngine::with_options(registry(), options)
}

pub fn store() -> SqliteStore {
    SqliteStore::open_in_memory(schemas()).unwrap()
}

pub fn id(value: i64) -> EntityIdentity {
    EntityIdentity::new(vec![("Id".to_string(), Scalar::Int(value))]).unwrap()
}

pub fn company(id: i64, name: &str, version: i64) -> Entity {
    Entity::new("Company")
        .with_field("Id", Scalar::Int(id))
        .with_field("Name", Scalar::Text(name.to_string()))
        .with_field("Version", Scalar::Int(version))
}

// detached contact addressed by its alternate key; the natural key is left
// for the store to generate
pub fn contact(email: &str, name: &str) -> Entity {
    Entity::new("Contact")
        .with_field("Id", Scalar::Int(0))
        .with_field("Email", Scalar::Text(email.to_string()))
        .with_field("Name", Scalar::Text(name.to_string()))
}

pub fn info(value: &str) -> Entity {
    Entity::new("ContactInfo")
        .with_field("Id", Scalar::Int(0))
        .with_field("Value", Scalar::Text(value.to_string()))
}

pub fn address(id: i64, city: &str) -> Entity {
    Entity::new("Address")
        .with_field("Id", Scalar::Int(id))
        .with_field("City", Scalar::Text(city.to_string()))
}

pub fn manager(id: i64, name: &str) -> Entity {
    Entity::new("Manager")
        .with_field("Id", Scalar::Int(id))
        .with_field("Name", Scalar::Text(name.to_string()))
}

pub fn text(value: &str) -> Scalar {
    Scalar::Text(value.to_string())
}
