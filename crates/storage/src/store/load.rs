#![forbid(unsafe_code)]

use super::encode::{fields_from_json, ident_key, sql_err};
use super::{SqliteStore, schema_err};
use gm_core::{Entity, EntityIdentity, IncludePath, LoadMode, RelationValue, StoreError};
use rusqlite::{OptionalExtension, params, params_from_iter};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct IncludeTree(BTreeMap<String, IncludeTree>);

impl IncludeTree {
    fn from_paths(paths: &[IncludePath]) -> Self {
        let mut root = IncludeTree::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.segments() {
                node = node.0.entry(segment.clone()).or_default();
            }
        }
        root
    }
}

impl SqliteStore {
    pub(crate) fn load_root(
        &mut self,
        type_name: &str,
        identity: &EntityIdentity,
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Option<Entity>, StoreError> {
        let ident = ident_key(identity)?;
        let Some(mut entity) = self.load_row(type_name, &ident)? else {
            return Ok(None);
        };
        self.mark_tracked(type_name, &ident);
        self.load_includes(&mut entity, include, mode)?;
        Ok(Some(entity))
    }

    pub(crate) fn load_many_roots(
        &mut self,
        type_name: &str,
        identities: &[EntityIdentity],
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Vec<Option<Entity>>, StoreError> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        let idents: Vec<String> = identities
            .iter()
            .map(ident_key)
            .collect::<Result<_, _>>()?;

        // One existence/load query for the whole batch.
        let sql = format!(
            "SELECT ident, fields FROM entities WHERE type=? AND ident IN ({})",
            placeholders(idents.len())
        );
        let mut found: BTreeMap<String, String> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
            let bind: Vec<&str> = std::iter::once(type_name)
                .chain(idents.iter().map(String::as_str))
                .collect();
            let mut rows = stmt.query(params_from_iter(bind)).map_err(sql_err)?;
            while let Some(row) = rows.next().map_err(sql_err)? {
                let ident: String = row.get(0).map_err(sql_err)?;
                let fields: String = row.get(1).map_err(sql_err)?;
                found.insert(ident, fields);
            }
        }

        let mut out = Vec::with_capacity(identities.len());
        for ident in &idents {
            match found.get(ident) {
                Some(raw) => {
                    let mut entity = Entity::new(type_name);
                    entity.fields = fields_from_json(raw)?;
                    self.mark_tracked(type_name, ident);
                    self.load_includes(&mut entity, include, mode)?;
                    out.push(Some(entity));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    pub(crate) fn load_row(
        &self,
        type_name: &str,
        ident: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT fields FROM entities WHERE type=?1 AND ident=?2",
                params![type_name, ident],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(sql_err)?;
        match raw {
            Some(raw) => {
                let mut entity = Entity::new(type_name);
                entity.fields = fields_from_json(&raw)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    fn load_includes(
        &mut self,
        entity: &mut Entity,
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<(), StoreError> {
        match mode {
            LoadMode::PerPath => {
                for path in include {
                    self.load_path(entity, path.segments())?;
                }
                Ok(())
            }
            LoadMode::Batched => {
                let tree = IncludeTree::from_paths(include);
                self.load_batched(vec![entity], &tree)
            }
        }
    }

    // One query per include path segment per parent. Overlapping prefixes
    // reuse the already-loaded relation.
    fn load_path(&mut self, entity: &mut Entity, segments: &[String]) -> Result<(), StoreError> {
        let Some((first, rest)) = segments.split_first() else {
            return Ok(());
        };
        if !entity.relations.contains_key(first) {
            self.load_relation(entity, first)?;
        }
        match entity.relations.get_mut(first) {
            Some(RelationValue::Many(items)) => {
                for child in items.iter_mut() {
                    self.load_path(child, rest)?;
                }
            }
            Some(RelationValue::One(Some(child))) => self.load_path(child, rest)?,
            _ => {}
        }
        Ok(())
    }

    fn load_relation(&mut self, entity: &mut Entity, relation: &str) -> Result<(), StoreError> {
        let many = self
            .schemas
            .relation(&entity.type_name, relation)
            .map_err(schema_err)?
            .many;
        let identity = self.natural_identity(entity)?;
        let parent_ident = ident_key(&identity)?;

        let mut ends = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT child_type, child_ident FROM links \
                     WHERE parent_type=?1 AND parent_ident=?2 AND relation=?3 \
                     ORDER BY position",
                )
                .map_err(sql_err)?;
            let mut rows = stmt
                .query(params![entity.type_name, parent_ident, relation])
                .map_err(sql_err)?;
            while let Some(row) = rows.next().map_err(sql_err)? {
                let child_type: String = row.get(0).map_err(sql_err)?;
                let child_ident: String = row.get(1).map_err(sql_err)?;
                ends.push((child_type, child_ident));
            }
        }

        let mut children = Vec::with_capacity(ends.len());
        for (child_type, child_ident) in ends {
            let child = self.load_row(&child_type, &child_ident)?.ok_or(
                StoreError::InvalidInput("relation link references a missing entity row"),
            )?;
            self.mark_tracked(&child_type, &child_ident);
            children.push(child);
        }

        if many {
            entity.set_many(relation, children);
        } else {
            entity.set_one(relation, children.into_iter().next());
        }
        Ok(())
    }

    // Level-at-a-time loading: for each relation in the include tree, one
    // link query covering every parent at that level and one entity query per
    // child type, instead of a query per parent.
    fn load_batched(
        &mut self,
        mut parents: Vec<&mut Entity>,
        tree: &IncludeTree,
    ) -> Result<(), StoreError> {
        if parents.is_empty() || tree.0.is_empty() {
            return Ok(());
        }

        for (relation, subtree) in &tree.0 {
            let parent_type = parents[0].type_name.clone();
            let many = self
                .schemas
                .relation(&parent_type, relation)
                .map_err(schema_err)?
                .many;

            let mut parent_idents = Vec::with_capacity(parents.len());
            for parent in parents.iter() {
                let identity = self.natural_identity(parent)?;
                parent_idents.push(ident_key(&identity)?);
            }

            // parent ident -> ordered child ends
            let mut by_parent: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
            {
                let sql = format!(
                    "SELECT parent_ident, child_type, child_ident FROM links \
                     WHERE parent_type=? AND relation=? AND parent_ident IN ({}) \
                     ORDER BY parent_ident, position",
                    placeholders(parent_idents.len())
                );
                let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
                let bind: Vec<&str> = [parent_type.as_str(), relation.as_str()]
                    .into_iter()
                    .chain(parent_idents.iter().map(String::as_str))
                    .collect();
                let mut rows = stmt.query(params_from_iter(bind)).map_err(sql_err)?;
                while let Some(row) = rows.next().map_err(sql_err)? {
                    let parent_ident: String = row.get(0).map_err(sql_err)?;
                    let child_type: String = row.get(1).map_err(sql_err)?;
                    let child_ident: String = row.get(2).map_err(sql_err)?;
                    by_parent
                        .entry(parent_ident)
                        .or_default()
                        .push((child_type, child_ident));
                }
            }

            // one fields query per child type
            let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for ends in by_parent.values() {
                for (child_type, child_ident) in ends {
                    let idents = wanted.entry(child_type.clone()).or_default();
                    if !idents.contains(child_ident) {
                        idents.push(child_ident.clone());
                    }
                }
            }
            let mut rows_by_end: BTreeMap<(String, String), String> = BTreeMap::new();
            for (child_type, idents) in &wanted {
                let sql = format!(
                    "SELECT ident, fields FROM entities WHERE type=? AND ident IN ({})",
                    placeholders(idents.len())
                );
                let mut stmt = self.conn.prepare(&sql).map_err(sql_err)?;
                let bind: Vec<&str> = std::iter::once(child_type.as_str())
                    .chain(idents.iter().map(String::as_str))
                    .collect();
                let mut rows = stmt.query(params_from_iter(bind)).map_err(sql_err)?;
                while let Some(row) = rows.next().map_err(sql_err)? {
                    let ident: String = row.get(0).map_err(sql_err)?;
                    let fields: String = row.get(1).map_err(sql_err)?;
                    rows_by_end.insert((child_type.clone(), ident), fields);
                }
            }

            for (parent, parent_ident) in parents.iter_mut().zip(parent_idents.iter()) {
                let ends = by_parent.remove(parent_ident).unwrap_or_default();
                let mut children = Vec::with_capacity(ends.len());
                for (child_type, child_ident) in ends {
                    let raw = rows_by_end
                        .get(&(child_type.clone(), child_ident.clone()))
                        .ok_or(StoreError::InvalidInput(
                            "relation link references a missing entity row",
                        ))?;
                    let mut child = Entity::new(child_type.clone());
                    child.fields = fields_from_json(raw)?;
                    self.mark_tracked(&child_type, &child_ident);
                    children.push(child);
                }
                if many {
                    parent.set_many(relation.clone(), children);
                } else {
                    parent.set_one(relation.clone(), children.into_iter().next());
                }
            }

            let mut next_level: Vec<&mut Entity> = Vec::new();
            for parent in parents.iter_mut() {
                match parent.relations.get_mut(relation) {
                    Some(RelationValue::Many(items)) => next_level.extend(items.iter_mut()),
                    Some(RelationValue::One(Some(child))) => next_level.push(child),
                    _ => {}
                }
            }
            self.load_batched(next_level, subtree)?;
        }
        Ok(())
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for index in 0..count {
        if index > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
