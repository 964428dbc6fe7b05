#![forbid(unsafe_code)]

use crate::error::{MergeError, UsageError};
use crate::markers::MarkerTable;
use gm_core::{MappingTree, SchemaRegistry};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const DEFAULT_SCHEME: &str = "default";

type TreeKey = (String, String);

// Shared mapping cache keyed by (scheme, root type). Lookups of built trees
// take a read lock only; building runs under a separate mutex so concurrent
// first-time lookups of the same tree do the work once. An explicitly
// registered tree always wins over one derived from markers.
pub struct MappingRegistry {
    schemas: Arc<SchemaRegistry>,
    markers: RwLock<MarkerTable>,
    declared: RwLock<BTreeMap<TreeKey, Arc<MappingTree>>>,
    built: RwLock<BTreeMap<TreeKey, Arc<MappingTree>>>,
    build_lock: Mutex<()>,
}

impl MappingRegistry {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            markers: RwLock::new(MarkerTable::new()),
            declared: RwLock::new(BTreeMap::new()),
            built: RwLock::new(BTreeMap::new()),
            build_lock: Mutex::new(()),
        }
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn set_markers(&self, markers: MarkerTable) {
        *write_lock(&self.markers) = markers;
        write_lock(&self.built).clear();
    }

    pub fn register(&self, scheme: impl Into<String>, tree: MappingTree) {
        let key = (scheme.into(), tree.root_type.clone());
        let tree = Arc::new(tree);
        write_lock(&self.declared).insert(key.clone(), Arc::clone(&tree));
        write_lock(&self.built).insert(key, tree);
    }

    pub fn get_or_build(
        &self,
        scheme: &str,
        root_type: &str,
    ) -> Result<Arc<MappingTree>, MergeError> {
        let key = (scheme.to_string(), root_type.to_string());
        if let Some(tree) = read_lock(&self.built).get(&key) {
            return Ok(Arc::clone(tree));
        }

        let _guard = build_lock(&self.build_lock);
        if let Some(tree) = read_lock(&self.built).get(&key) {
            return Ok(Arc::clone(tree));
        }

        let tree = if let Some(declared) = read_lock(&self.declared).get(&key) {
            Arc::clone(declared)
        } else {
            let markers = read_lock(&self.markers);
            if !markers.defines(root_type) {
                return Err(MergeError::Usage(UsageError::NoMappingRegistered {
                    type_name: root_type.to_string(),
                    scheme: scheme.to_string(),
                }));
            }
            Arc::new(markers.build(&self.schemas, root_type)?)
        };
        write_lock(&self.built).insert(key, Arc::clone(&tree));
        Ok(tree)
    }

    pub fn clear_all(&self) {
        write_lock(&self.declared).clear();
        write_lock(&self.built).clear();
        *write_lock(&self.markers) = MarkerTable::new();
    }
}

// Lock poisoning carries no meaning here (the guarded state is always left
// consistent), so a poisoned guard is recovered rather than propagated.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|err| err.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|err| err.into_inner())
}

fn build_lock(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{MappingBuilder, owned_many};
    use crate::markers::{Ownership, RelationMarker};
    use gm_core::{EntitySchema, NodeKind, RelationSchema};

    fn schemas() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .define_all([
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
                },
                EntitySchema {
                    type_name: "Contact".to_string(),
                    key: vec!["Id".to_string()],
                    alternate_key: None,
                    concurrency_token: None,
                    relations: Vec::new(),
                    required_relations: Vec::new(),
                },
            ])
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn unknown_root_reports_missing_mapping() {
        let registry = MappingRegistry::new(schemas());
        let err = registry.get_or_build(DEFAULT_SCHEME, "Company").unwrap_err();
        assert!(matches!(
            err,
            MergeError::Usage(UsageError::NoMappingRegistered { .. })
        ));
    }

    #[test]
    fn registration_wins_over_markers() {
        let registry = MappingRegistry::new(schemas());
        let mut table = MarkerTable::new();
        table.mark(
            "Company",
            RelationMarker {
                relation: "Contacts".to_string(),
                ownership: Ownership::Associated,
                back_reference: None,
                aggregate: None,
            },
        );
        registry.set_markers(table);

        let explicit = MappingBuilder::for_root("Company")
            .relation(owned_many("Contacts"))
            .build(registry.schemas())
            .unwrap();
        registry.register(DEFAULT_SCHEME, explicit);

        let tree = registry.get_or_build(DEFAULT_SCHEME, "Company").unwrap();
        assert_eq!(tree.children[0].kind, NodeKind::OwnedCollection);
    }

    #[test]
    fn built_trees_are_cached_and_shared() {
        let registry = MappingRegistry::new(schemas());
        let mut table = MarkerTable::new();
        table.mark(
            "Company",
            RelationMarker {
                relation: "Contacts".to_string(),
                ownership: Ownership::Owned,
                back_reference: None,
                aggregate: None,
            },
        );
        registry.set_markers(table);

        let first = registry.get_or_build(DEFAULT_SCHEME, "Company").unwrap();
        let second = registry.get_or_build(DEFAULT_SCHEME, "Company").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.clear_all();
        assert!(registry.get_or_build(DEFAULT_SCHEME, "Company").is_err());
    }

    #[test]
    fn schemes_are_independent() {
        let registry = MappingRegistry::new(schemas());
        let tree = MappingBuilder::for_root("Company")
            .relation(owned_many("Contacts"))
            .build(registry.schemas())
            .unwrap();
        registry.register("import", tree);

        assert!(registry.get_or_build("import", "Company").is_ok());
        assert!(registry.get_or_build(DEFAULT_SCHEME, "Company").is_err());
    }
}
