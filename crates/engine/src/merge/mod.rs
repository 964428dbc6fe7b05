#![forbid(unsafe_code)]

mod collection;
mod entity;

use crate::error::{MergeError, UsageError};
use crate::options::{DuplicatePolicy, MergeOptions};
use crate::registry::{DEFAULT_SCHEME, MappingRegistry};
use gm_core::{
    Entity, EntityIdentity, EntityRef, IdentityResolver, IncludePath, MappingNode, MappingTree,
    NodeKind, PersistenceContext,
};
use std::collections::BTreeSet;
use std::sync::Arc;

// Reconciles detached entity graphs against a persistence context. The engine
// itself is stateless across calls; every mutation goes through the store's
// unit of work, and commit/rollback stay with the caller.
pub struct MergeEngine {
    registry: Arc<MappingRegistry>,
    resolver: IdentityResolver,
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(registry: Arc<MappingRegistry>) -> Self {
        Self::with_options(registry, MergeOptions::default())
    }

    pub fn with_options(registry: Arc<MappingRegistry>, options: MergeOptions) -> Self {
        let resolver = IdentityResolver::new(Arc::clone(registry.schemas()));
        Self {
            registry,
            resolver,
            options,
        }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn merge(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &Entity,
    ) -> Result<Entity, MergeError> {
        self.merge_with_scheme(store, incoming, DEFAULT_SCHEME)
    }

    pub fn merge_with_scheme(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &Entity,
        scheme: &str,
    ) -> Result<Entity, MergeError> {
        let tree = self.registry.get_or_build(scheme, &incoming.type_name)?;
        self.merge_with(store, incoming, &tree)
    }

    // Merges against a caller-supplied mapping tree, bypassing the registry.
    pub fn merge_with(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &Entity,
        tree: &MappingTree,
    ) -> Result<Entity, MergeError> {
        if incoming.type_name != tree.root_type {
            return Err(UsageError::WrongRootType {
                expected: tree.root_type.clone(),
                actual: incoming.type_name.clone(),
            }
            .into());
        }
        let includes = self.includes_for(store, tree)?;
        let identity = self.resolver.identity_of(incoming)?;
        self.guard_not_tracked(store, &incoming.type_name, &identity)?;

        let persisted = if identity.is_unset() && self.options.skip_load_for_new {
            None
        } else {
            store.find_by_key(
                &incoming.type_name,
                &identity,
                &includes,
                self.options.load_mode,
            )?
        };
        self.merge_root(store, incoming, persisted, tree)
    }

    pub fn merge_batch(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &[Entity],
    ) -> Result<Vec<Entity>, MergeError> {
        self.merge_batch_with_scheme(store, incoming, DEFAULT_SCHEME)
    }

    pub fn merge_batch_with_scheme(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &[Entity],
        scheme: &str,
    ) -> Result<Vec<Entity>, MergeError> {
        let Some(first) = incoming.first() else {
            return Ok(Vec::new());
        };
        let tree = self.registry.get_or_build(scheme, &first.type_name)?;
        self.merge_batch_with(store, incoming, &tree)
    }

    // Batch variant: one existence/load query for every assigned root key,
    // then the regular per-root reconciliation. All roots must share the
    // tree's root type.
    pub fn merge_batch_with(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &[Entity],
        tree: &MappingTree,
    ) -> Result<Vec<Entity>, MergeError> {
        if incoming.is_empty() {
            return Ok(Vec::new());
        }
        for item in incoming {
            if item.type_name != tree.root_type {
                return Err(UsageError::MixedBatch {
                    expected: tree.root_type.clone(),
                    actual: item.type_name.clone(),
                }
                .into());
            }
        }

        let includes = self.includes_for(store, tree)?;

        let mut identities = Vec::with_capacity(incoming.len());
        let mut seen = BTreeSet::new();
        for item in incoming {
            let identity = self.resolver.identity_of(item)?;
            if !identity.is_unset() {
                if !seen.insert(identity.clone()) {
                    return Err(UsageError::DuplicateIdentity {
                        type_name: tree.root_type.clone(),
                        identity: identity.to_string(),
                    }
                    .into());
                }
                self.guard_not_tracked(store, &tree.root_type, &identity)?;
            }
            identities.push(identity);
        }

        let mut lookups: Vec<(usize, EntityIdentity)> = Vec::new();
        for (index, identity) in identities.iter().enumerate() {
            if !(identity.is_unset() && self.options.skip_load_for_new) {
                lookups.push((index, identity.clone()));
            }
        }
        let lookup_keys: Vec<EntityIdentity> =
            lookups.iter().map(|(_, identity)| identity.clone()).collect();
        let loaded = store.find_many_by_key(
            &tree.root_type,
            &lookup_keys,
            &includes,
            self.options.load_mode,
        )?;

        let mut persisted: Vec<Option<Entity>> = (0..incoming.len()).map(|_| None).collect();
        for ((index, _), row) in lookups.into_iter().zip(loaded) {
            persisted[index] = row;
        }

        incoming
            .iter()
            .zip(persisted)
            .map(|(item, row)| self.merge_root(store, item, row, tree))
            .collect()
    }

    fn merge_root(
        &self,
        store: &mut dyn PersistenceContext,
        incoming: &Entity,
        persisted: Option<Entity>,
        tree: &MappingTree,
    ) -> Result<Entity, MergeError> {
        let mut target = match persisted {
            Some(mut found) => {
                store.apply_current_values(&mut found, incoming, true)?;
                found
            }
            None => {
                let mut fresh = Entity::new(incoming.type_name.clone());
                copy_fields(incoming, &mut fresh);
                store.add(&mut fresh)?;
                fresh
            }
        };
        for node in &tree.children {
            self.merge_node(store, &mut target, incoming, node)?;
        }
        Ok(target)
    }

    pub(crate) fn merge_node(
        &self,
        store: &mut dyn PersistenceContext,
        target: &mut Entity,
        incoming: &Entity,
        node: &MappingNode,
    ) -> Result<(), MergeError> {
        match node.kind {
            NodeKind::OwnedEntity => self.merge_owned_entity(store, target, incoming, node),
            NodeKind::AssociatedEntity => {
                self.merge_associated_entity(store, target, incoming, node)
            }
            NodeKind::OwnedCollection => self.merge_owned_collection(store, target, incoming, node),
            NodeKind::AssociatedCollection => {
                self.merge_associated_collection(store, target, incoming, node)
            }
        }
    }

    // Reconciles one owned child value: update the persisted instance when
    // there is one, insert a fresh copy otherwise, then descend into the
    // node's subtree.
    pub(crate) fn merge_owned_value(
        &self,
        store: &mut dyn PersistenceContext,
        incoming_child: &Entity,
        persisted_child: Option<Entity>,
        node: &MappingNode,
        parent: &EntityRef,
    ) -> Result<Entity, MergeError> {
        let mut target = match persisted_child {
            Some(mut found) => {
                store.apply_current_values(&mut found, incoming_child, true)?;
                found
            }
            None => {
                let mut fresh = Entity::new(incoming_child.type_name.clone());
                copy_fields(incoming_child, &mut fresh);
                store.add(&mut fresh)?;
                fresh
            }
        };
        if let Some(back) = &node.back_reference {
            self.set_back_reference(store, &mut target, parent, back)?;
        }
        for child_node in &node.children {
            self.merge_node(store, &mut target, incoming_child, child_node)?;
        }
        Ok(target)
    }

    // The child keeps a key-only stub of its parent, so the merged in-memory
    // tree stays acyclic while both link directions are persisted.
    pub(crate) fn set_back_reference(
        &self,
        store: &mut dyn PersistenceContext,
        child: &mut Entity,
        parent: &EntityRef,
        back: &str,
    ) -> Result<(), MergeError> {
        child.set_one(back, Some(parent.identity.to_stub(&parent.type_name)));
        let child_ref = self.entity_ref(child)?;
        store.set_link(&child_ref, back, Some(parent), false)?;
        Ok(())
    }

    pub(crate) fn entity_ref(&self, entity: &Entity) -> Result<EntityRef, MergeError> {
        let identity = self.resolver.identity_of(entity)?;
        Ok(EntityRef::new(entity.type_name.clone(), identity))
    }

    // Matching identity (alternate key when configured), treating an unset
    // key as no identity at all so that unset never matches unset.
    pub(crate) fn matching_of(
        &self,
        entity: &Entity,
    ) -> Result<Option<EntityIdentity>, MergeError> {
        let identity = self.resolver.matching_identity_of(entity)?;
        Ok((!identity.is_unset()).then_some(identity))
    }

    // Drops or rejects same-identity duplicates inside one incoming
    // collection before any store work happens.
    pub(crate) fn dedupe<'a>(
        &self,
        items: &'a [Entity],
        type_name: &str,
    ) -> Result<Vec<&'a Entity>, MergeError> {
        let mut keep: Vec<&Entity> = Vec::with_capacity(items.len());
        let mut seen: std::collections::BTreeMap<EntityIdentity, usize> =
            std::collections::BTreeMap::new();
        for item in items {
            match self.matching_of(item)? {
                Some(identity) => match seen.get(&identity) {
                    Some(&index) => match self.options.duplicates {
                        DuplicatePolicy::LastWins => keep[index] = item,
                        DuplicatePolicy::Reject => {
                            return Err(UsageError::DuplicateIdentity {
                                type_name: type_name.to_string(),
                                identity: identity.to_string(),
                            }
                            .into());
                        }
                    },
                    None => {
                        seen.insert(identity, keep.len());
                        keep.push(item);
                    }
                },
                None => keep.push(item),
            }
        }
        Ok(keep)
    }

    fn includes_for(
        &self,
        store: &mut dyn PersistenceContext,
        tree: &MappingTree,
    ) -> Result<Vec<IncludePath>, MergeError> {
        let mut includes = tree.include_paths();
        for path in store.required_relations_for(&tree.root_type)? {
            if !includes.contains(&path) {
                includes.push(path);
            }
        }
        Ok(includes)
    }

    // Eager-load paths for a replacement child loaded outside the root query.
    pub(crate) fn subtree_includes(
        &self,
        store: &mut dyn PersistenceContext,
        node: &MappingNode,
    ) -> Result<Vec<IncludePath>, MergeError> {
        let tree = MappingTree {
            root_type: node.target_type.clone(),
            children: node.children.clone(),
        };
        self.includes_for(store, &tree)
    }

    fn guard_not_tracked(
        &self,
        store: &mut dyn PersistenceContext,
        type_name: &str,
        identity: &EntityIdentity,
    ) -> Result<(), MergeError> {
        if store.is_tracked(type_name, identity) {
            return Err(UsageError::AlreadyTracked {
                type_name: type_name.to_string(),
                identity: identity.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

pub(crate) fn copy_fields(from: &Entity, to: &mut Entity) {
    for (name, value) in &from.fields {
        to.set_field(name.clone(), value.clone());
    }
}
