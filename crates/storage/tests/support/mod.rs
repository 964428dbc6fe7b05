#![allow(dead_code)]

use gm_core::{
    Entity, EntityIdentity, EntitySchema, MappingNode, MappingTree, NodeKind, RelationSchema,
    Scalar, SchemaRegistry,
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
                ],
                required_relations: Vec::new(),
            },
            EntitySchema {
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
            },
            EntitySchema {
                type_name: "Address".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "Manager".to_string(),
                key: vec!["Id".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            },
            EntitySchema {
                type_name: "Assignment".to_string(),
                key: vec!["CompanyId".to_string(), "ContactId".to_string()],
                alternate_key: None,
                concurrency_token: None,
                relations: Vec::new(),
                required_relations: Vec::new(),
            },
        ])
        .unwrap();
    registry.validate().unwrap();
    Arc::new(registry)
}

pub fn store() -> SqliteStore {
    SqliteStore::open_in_memory(schemas()).unwrap()
}

pub fn company_tree() -> MappingTree {
    MappingTree {
        root_type: "Company".to_string(),
        children: vec![
            MappingNode {
                accessor: "Contacts".to_string(),
                target_type: "Contact".to_string(),
                kind: NodeKind::OwnedCollection,
                back_reference: Some("Company".to_string()),
                children: Vec::new(),
            },
            MappingNode {
                accessor: "HeadOffice".to_string(),
                target_type: "Address".to_string(),
                kind: NodeKind::OwnedEntity,
                back_reference: None,
                children: Vec::new(),
            },
            MappingNode {
                accessor: "Auditor".to_string(),
                target_type: "Manager".to_string(),
                kind: NodeKind::AssociatedEntity,
                back_reference: None,
                children: Vec::new(),
            },
        ],
    }
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

pub fn contact(id: i64, email: &str) -> Entity {
    Entity::new("Contact")
        .with_field("Id", Scalar::Int(id))
        .with_field("Email", Scalar::Text(email.to_string()))
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
