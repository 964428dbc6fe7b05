#![forbid(unsafe_code)]

use super::MergeEngine;
use crate::error::{MergeError, UsageError};
use gm_core::{Entity, EntityRef, MappingNode, PersistenceContext};

impl MergeEngine {
    // Single-valued owned relation. Same identity updates in place; a
    // different incoming instance replaces the current one, cascading the old
    // row; an absent incoming value clears the relation unless removals are
    // off.
    pub(crate) fn merge_owned_entity(
        &self,
        store: &mut dyn PersistenceContext,
        target: &mut Entity,
        incoming: &Entity,
        node: &MappingNode,
    ) -> Result<(), MergeError> {
        let parent_ref = self.entity_ref(target)?;

        let Some(incoming_child) = incoming.one(&node.accessor) else {
            if target.one(&node.accessor).is_some() && !self.options.never_remove {
                store.set_link(&parent_ref, &node.accessor, None, true)?;
                target.set_one(&node.accessor, None);
            }
            return Ok(());
        };

        let incoming_matching = self.matching_of(incoming_child)?;
        let current_matching = match target.one(&node.accessor) {
            Some(current) => self.matching_of(current)?,
            None => None,
        };
        let same_instance = matches!(
            (&incoming_matching, &current_matching),
            (Some(a), Some(b)) if a == b
        );

        if same_instance {
            let Some(current) = target.one_mut(&node.accessor) else {
                return Ok(());
            };
            store.apply_current_values(current, incoming_child, true)?;
            if let Some(back) = &node.back_reference {
                self.set_back_reference(store, current, &parent_ref, back)?;
            }
            for child_node in &node.children {
                self.merge_node(store, current, incoming_child, child_node)?;
            }
            return Ok(());
        }

        let natural = self.resolver.identity_of(incoming_child)?;
        let persisted = if natural.is_unset() && self.options.skip_load_for_new {
            None
        } else {
            let includes = self.subtree_includes(store, node)?;
            store.find_by_key(&node.target_type, &natural, &includes, self.options.load_mode)?
        };
        let merged = self.merge_owned_value(store, incoming_child, persisted, node, &parent_ref)?;
        let child_ref = self.entity_ref(&merged)?;
        // owned link replacement cascades the previous child, if any
        store.set_link(&parent_ref, &node.accessor, Some(&child_ref), true)?;
        target.set_one(&node.accessor, Some(merged));
        Ok(())
    }

    // Single-valued associated relation. Only the link is reconciled; the
    // referenced instance's stored fields are never written.
    pub(crate) fn merge_associated_entity(
        &self,
        store: &mut dyn PersistenceContext,
        target: &mut Entity,
        incoming: &Entity,
        node: &MappingNode,
    ) -> Result<(), MergeError> {
        let parent_ref = self.entity_ref(target)?;

        let Some(incoming_child) = incoming.one(&node.accessor) else {
            if target.one(&node.accessor).is_some() && !self.options.never_remove {
                store.set_link(&parent_ref, &node.accessor, None, false)?;
                target.set_one(&node.accessor, None);
            }
            return Ok(());
        };

        let identity = self.resolver.identity_of(incoming_child)?;
        if identity.is_unset() {
            return Err(UsageError::AssociatedWithoutIdentity {
                type_name: node.target_type.clone(),
            }
            .into());
        }

        if let Some(current) = target.one(&node.accessor) {
            if self.resolver.identity_of(current)? == identity {
                return Ok(());
            }
        }

        let resolved =
            store.attach_and_reload(incoming_child, self.options.reload_associated_on_attach)?;
        let child_ref = EntityRef::new(node.target_type.clone(), identity);
        store.set_link(&parent_ref, &node.accessor, Some(&child_ref), false)?;
        target.set_one(&node.accessor, Some(resolved));
        Ok(())
    }
}
