#![forbid(unsafe_code)]

use super::MergeEngine;
use crate::error::{MergeError, UsageError};
use gm_core::{Entity, EntityIdentity, EntityRef, MappingNode, PersistenceContext};
use std::collections::BTreeMap;

impl MergeEngine {
    // Set reconciliation for an owned collection: matched members update in
    // place, unmatched incoming members are inserted, loaded members missing
    // from the incoming set drop out (their rows cascade when the link set is
    // replaced) unless removals are off.
    pub(crate) fn merge_owned_collection(
        &self,
        store: &mut dyn PersistenceContext,
        target: &mut Entity,
        incoming: &Entity,
        node: &MappingNode,
    ) -> Result<(), MergeError> {
        let parent_ref = self.entity_ref(target)?;
        let items = self.dedupe(incoming.many(&node.accessor), &node.target_type)?;

        let mut slots: Vec<Option<Entity>> =
            target.take_many(&node.accessor).into_iter().map(Some).collect();
        let mut by_identity: BTreeMap<EntityIdentity, usize> = BTreeMap::new();
        for (index, slot) in slots.iter().enumerate() {
            let Some(member) = slot else { continue };
            if let Some(identity) = self.matching_of(member)? {
                by_identity.insert(identity, index);
            }
        }

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let matched = match self.matching_of(item)? {
                Some(identity) => by_identity.remove(&identity),
                None => None,
            };
            match matched.and_then(|index| slots[index].take()) {
                Some(mut member) => {
                    store.apply_current_values(&mut member, item, true)?;
                    if let Some(back) = &node.back_reference {
                        self.set_back_reference(store, &mut member, &parent_ref, back)?;
                    }
                    for child_node in &node.children {
                        self.merge_node(store, &mut member, item, child_node)?;
                    }
                    out.push(member);
                }
                None => {
                    let merged = self.merge_owned_value(store, item, None, node, &parent_ref)?;
                    out.push(merged);
                }
            }
        }

        for slot in slots {
            if let Some(kept) = slot {
                if self.options.never_remove {
                    out.push(kept);
                }
            }
        }

        let refs = self.member_refs(&out)?;
        store.replace_links(&parent_ref, &node.accessor, &refs, true)?;
        target.set_many(&node.accessor, out);
        Ok(())
    }

    // Associated collection: pure membership reconciliation. Matched members
    // stay as loaded, new members are attached by key, dropped members are
    // detached without touching their rows.
    pub(crate) fn merge_associated_collection(
        &self,
        store: &mut dyn PersistenceContext,
        target: &mut Entity,
        incoming: &Entity,
        node: &MappingNode,
    ) -> Result<(), MergeError> {
        let parent_ref = self.entity_ref(target)?;
        let items = self.dedupe(incoming.many(&node.accessor), &node.target_type)?;

        let mut slots: Vec<Option<Entity>> =
            target.take_many(&node.accessor).into_iter().map(Some).collect();
        let mut by_identity: BTreeMap<EntityIdentity, usize> = BTreeMap::new();
        for (index, slot) in slots.iter().enumerate() {
            let Some(member) = slot else { continue };
            if let Some(identity) = self.matching_of(member)? {
                by_identity.insert(identity, index);
            }
        }

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if self.resolver.identity_of(item)?.is_unset() {
                return Err(UsageError::AssociatedWithoutIdentity {
                    type_name: node.target_type.clone(),
                }
                .into());
            }
            let matched = match self.matching_of(item)? {
                Some(identity) => by_identity.remove(&identity),
                None => None,
            };
            match matched.and_then(|index| slots[index].take()) {
                Some(member) => out.push(member),
                None => {
                    let mut attached =
                        store.attach_and_reload(item, self.options.reload_associated_on_attach)?;
                    // an explicit back-reference is set on attach and left
                    // alone on members that were already linked
                    if let Some(back) = &node.back_reference {
                        self.set_back_reference(store, &mut attached, &parent_ref, back)?;
                    }
                    out.push(attached);
                }
            }
        }

        for slot in slots {
            if let Some(kept) = slot {
                if self.options.never_remove {
                    out.push(kept);
                }
            }
        }

        let refs = self.member_refs(&out)?;
        store.replace_links(&parent_ref, &node.accessor, &refs, false)?;
        target.set_many(&node.accessor, out);
        Ok(())
    }

    fn member_refs(&self, members: &[Entity]) -> Result<Vec<EntityRef>, MergeError> {
        members.iter().map(|member| self.entity_ref(member)).collect()
    }
}
