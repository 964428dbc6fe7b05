#![forbid(unsafe_code)]

use super::encode::{fields_to_json, ident_key, key_floor, sql_err};
use super::{LinkEnd, PendingOp, SqliteStore, schema_err};
use gm_core::{Entity, EntityRef, Scalar, StoreError};
use rusqlite::{Connection, params};
use std::collections::BTreeSet;

impl SqliteStore {
    pub(crate) fn add_impl(&mut self, entity: &mut Entity) -> Result<(), StoreError> {
        let type_name = entity.type_name.clone();
        let key = self.schemas.expect(&type_name).map_err(schema_err)?.key.clone();

        let identity = self.natural_identity(entity)?;
        if identity.is_unset() {
            match key.as_slice() {
                [only] => {
                    let only = only.clone();
                    let next = self.next_counter(&type_name)?;
                    entity.set_field(only, Scalar::Int(next));
                }
                _ => {
                    return Err(StoreError::KeyNotGenerated {
                        type_name,
                        reason: "composite natural keys cannot be generated",
                    });
                }
            }
        }

        let identity = self.natural_identity(entity)?;
        let ident = ident_key(&identity)?;
        let fields = fields_to_json(&entity.fields)?;
        let floor = key_floor(&key, &entity.fields);
        self.mark_tracked(&type_name, &ident);
        self.push_op(PendingOp::Upsert {
            type_name,
            ident,
            fields,
            key_floor: floor,
        });
        Ok(())
    }

    pub(crate) fn remove_impl(&mut self, entity: &EntityRef) -> Result<(), StoreError> {
        let ident = ident_key(&entity.identity)?;
        self.push_op(PendingOp::Delete {
            type_name: entity.type_name.clone(),
            ident,
        });
        Ok(())
    }

    // Copies scalar fields present on the source over the target, verifying
    // the concurrency token first when asked. Identical values record
    // nothing, so an unchanged graph produces zero pending operations.
    pub(crate) fn apply_impl(
        &mut self,
        target: &mut Entity,
        source: &Entity,
        check_token: bool,
    ) -> Result<(), StoreError> {
        let type_name = target.type_name.clone();
        let (key, token) = {
            let schema = self.schemas.expect(&type_name).map_err(schema_err)?;
            (schema.key.clone(), schema.concurrency_token.clone())
        };

        if check_token {
            if let Some(token) = &token {
                if target.field(token) != source.field(token) {
                    let identity = self.natural_identity(target)?;
                    return Err(StoreError::StaleToken {
                        type_name,
                        identity: identity.to_string(),
                    });
                }
            }
        }

        let mut changed = false;
        for (name, value) in &source.fields {
            // an unset incoming key never clobbers an assigned one; matched
            // instances keep their stored key
            if key.contains(name)
                && value.is_unset()
                && target.field(name).is_some_and(|current| !current.is_unset())
            {
                continue;
            }
            if target.field(name) != Some(value) {
                target.set_field(name.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            let identity = self.natural_identity(target)?;
            let ident = ident_key(&identity)?;
            let fields = fields_to_json(&target.fields)?;
            let floor = key_floor(&key, &target.fields);
            self.push_op(PendingOp::Upsert {
                type_name,
                ident,
                fields,
                key_floor: floor,
            });
        }
        Ok(())
    }

    // Resolves an associated instance. Existing rows are never written; a row
    // that does not exist yet is inserted with the supplied fields.
    pub(crate) fn attach_impl(
        &mut self,
        entity: &Entity,
        reload: bool,
    ) -> Result<Entity, StoreError> {
        let type_name = entity.type_name.clone();
        let key = self.schemas.expect(&type_name).map_err(schema_err)?.key.clone();
        let identity = self.natural_identity(entity)?;
        if identity.is_unset() {
            return Err(StoreError::InvalidInput(
                "associated instance requires an assigned key",
            ));
        }
        let ident = ident_key(&identity)?;
        let stored = self.load_row(&type_name, &ident)?;
        self.mark_tracked(&type_name, &ident);
        match stored {
            Some(row) if reload => Ok(row),
            Some(_) => Ok(strip_relations(entity)),
            None => {
                let fields = fields_to_json(&entity.fields)?;
                let floor = key_floor(&key, &entity.fields);
                self.push_op(PendingOp::Upsert {
                    type_name,
                    ident,
                    fields,
                    key_floor: floor,
                });
                Ok(strip_relations(entity))
            }
        }
    }

    pub(crate) fn set_link_impl(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        child: Option<&EntityRef>,
        owned: bool,
    ) -> Result<(), StoreError> {
        self.schemas
            .relation(&parent.type_name, relation)
            .map_err(schema_err)?;
        let parent_end = link_end(parent)?;
        let desired = match child {
            Some(child) => vec![link_end(child)?],
            None => Vec::new(),
        };
        if self.current_links(&parent_end, relation)? == desired {
            return Ok(());
        }
        self.push_op(PendingOp::SetLink {
            parent: parent_end,
            relation: relation.to_string(),
            child: desired.into_iter().next(),
            owned,
        });
        Ok(())
    }

    pub(crate) fn replace_links_impl(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        children: &[EntityRef],
        owned: bool,
    ) -> Result<(), StoreError> {
        self.schemas
            .relation(&parent.type_name, relation)
            .map_err(schema_err)?;
        let parent_end = link_end(parent)?;
        let desired: Vec<LinkEnd> = children
            .iter()
            .map(link_end)
            .collect::<Result<_, _>>()?;
        if self.current_links(&parent_end, relation)? == desired {
            return Ok(());
        }
        self.push_op(PendingOp::ReplaceLinks {
            parent: parent_end,
            relation: relation.to_string(),
            children: desired,
            owned,
        });
        Ok(())
    }

    fn current_links(&self, parent: &LinkEnd, relation: &str) -> Result<Vec<LinkEnd>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT child_type, child_ident FROM links \
                 WHERE parent_type=?1 AND parent_ident=?2 AND relation=?3 \
                 ORDER BY position",
            )
            .map_err(sql_err)?;
        let mut rows = stmt
            .query(params![parent.type_name, parent.ident, relation])
            .map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            out.push(LinkEnd {
                type_name: row.get(0).map_err(sql_err)?,
                ident: row.get(1).map_err(sql_err)?,
            });
        }
        Ok(out)
    }
}

fn link_end(entity: &EntityRef) -> Result<LinkEnd, StoreError> {
    Ok(LinkEnd {
        type_name: entity.type_name.clone(),
        ident: ident_key(&entity.identity)?,
    })
}

fn strip_relations(entity: &Entity) -> Entity {
    let mut out = Entity::new(entity.type_name.clone());
    out.fields = entity.fields.clone();
    out
}

pub(crate) fn apply_op(conn: &Connection, op: &PendingOp) -> rusqlite::Result<()> {
    match op {
        PendingOp::Upsert {
            type_name,
            ident,
            fields,
            key_floor,
        } => upsert_row(conn, type_name, ident, fields, *key_floor),
        PendingOp::Delete { type_name, ident } => {
            let mut seen = BTreeSet::new();
            cascade_delete(conn, type_name, ident, &mut seen)
        }
        PendingOp::SetLink {
            parent,
            relation,
            child,
            owned,
        } => {
            let children: Vec<LinkEnd> = child.iter().cloned().collect();
            replace_relation(conn, parent, relation, &children, *owned)
        }
        PendingOp::ReplaceLinks {
            parent,
            relation,
            children,
            owned,
        } => replace_relation(conn, parent, relation, children, *owned),
    }
}

pub(crate) fn upsert_row(
    conn: &Connection,
    type_name: &str,
    ident: &str,
    fields: &str,
    key_floor: Option<i64>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO entities(type, ident, fields) VALUES (?1, ?2, ?3) \
         ON CONFLICT(type, ident) DO UPDATE SET fields=excluded.fields",
        params![type_name, ident, fields],
    )?;
    if let Some(value) = key_floor {
        raise_counter_floor(conn, type_name, value)?;
    }
    Ok(())
}

fn raise_counter_floor(conn: &Connection, type_name: &str, value: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO counters(type, value) VALUES (?1, ?2) \
         ON CONFLICT(type) DO UPDATE SET value=max(value, excluded.value)",
        params![type_name, value],
    )?;
    Ok(())
}

// Rewrites one relation's link rows. When the relation is owned, members
// dropped from the new set lose their last owning reference and are
// cascade-deleted.
pub(crate) fn replace_relation(
    conn: &Connection,
    parent: &LinkEnd,
    relation: &str,
    children: &[LinkEnd],
    owned: bool,
) -> rusqlite::Result<()> {
    let old: Vec<LinkEnd> = if owned {
        let mut stmt = conn.prepare(
            "SELECT child_type, child_ident FROM links \
             WHERE parent_type=?1 AND parent_ident=?2 AND relation=?3",
        )?;
        let mut rows = stmt.query(params![parent.type_name, parent.ident, relation])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(LinkEnd {
                type_name: row.get(0)?,
                ident: row.get(1)?,
            });
        }
        out
    } else {
        Vec::new()
    };

    conn.execute(
        "DELETE FROM links WHERE parent_type=?1 AND parent_ident=?2 AND relation=?3",
        params![parent.type_name, parent.ident, relation],
    )?;
    for (position, child) in children.iter().enumerate() {
        conn.execute(
            "INSERT OR REPLACE INTO links(parent_type, parent_ident, relation, position, child_type, child_ident, owned) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                parent.type_name,
                parent.ident,
                relation,
                position as i64,
                child.type_name,
                child.ident,
                owned as i64
            ],
        )?;
    }

    if owned {
        let mut seen = BTreeSet::new();
        for end in old {
            if !children.contains(&end) {
                cascade_delete(conn, &end.type_name, &end.ident, &mut seen)?;
            }
        }
    }
    Ok(())
}

fn cascade_delete(
    conn: &Connection,
    type_name: &str,
    ident: &str,
    seen: &mut BTreeSet<(String, String)>,
) -> rusqlite::Result<()> {
    if !seen.insert((type_name.to_string(), ident.to_string())) {
        return Ok(());
    }

    let owned_children: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT child_type, child_ident FROM links \
             WHERE parent_type=?1 AND parent_ident=?2 AND owned=1",
        )?;
        let mut rows = stmt.query(params![type_name, ident])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        out
    };

    conn.execute(
        "DELETE FROM links WHERE parent_type=?1 AND parent_ident=?2",
        params![type_name, ident],
    )?;
    conn.execute(
        "DELETE FROM links WHERE child_type=?1 AND child_ident=?2",
        params![type_name, ident],
    )?;
    conn.execute(
        "DELETE FROM entities WHERE type=?1 AND ident=?2",
        params![type_name, ident],
    )?;

    for (child_type, child_ident) in owned_children {
        cascade_delete(conn, &child_type, &child_ident, seen)?;
    }
    Ok(())
}
