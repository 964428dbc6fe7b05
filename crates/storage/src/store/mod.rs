#![forbid(unsafe_code)]

mod encode;
mod load;
mod write;

use encode::{fields_to_json, ident_key, key_floor, sql_err};
use gm_core::{
    Entity, EntityIdentity, EntityRef, IdentityResolver, IncludePath, LoadMode, MappingNode,
    MappingTree, PersistenceContext, SchemaRegistry, StoreError,
};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA_VERSION: &str = "v1";

// Reference persistence context over SQLite. Entity rows carry their scalar
// fields as one JSON column; relations live in an ownership-flagged link
// table. Mutations accumulate as pending operations until the caller commits
// or rolls back the unit of work.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    schemas: Arc<SchemaRegistry>,
    resolver: IdentityResolver,
    tracked: BTreeSet<(String, String)>,
    pending: Vec<PendingOp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LinkEnd {
    pub(crate) type_name: String,
    pub(crate) ident: String,
}

#[derive(Clone, Debug)]
pub(crate) enum PendingOp {
    Upsert {
        type_name: String,
        ident: String,
        fields: String,
        key_floor: Option<i64>,
    },
    Delete {
        type_name: String,
        ident: String,
    },
    SetLink {
        parent: LinkEnd,
        relation: String,
        child: Option<LinkEnd>,
        owned: bool,
    },
    ReplaceLinks {
        parent: LinkEnd,
        relation: String,
        children: Vec<LinkEnd>,
        owned: bool,
    },
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>, schemas: Arc<SchemaRegistry>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(sql_err)?;
        Self::with_connection(conn, schemas)
    }

    pub fn open_in_memory(schemas: Arc<SchemaRegistry>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::with_connection(conn, schemas)
    }

    fn with_connection(conn: Connection, schemas: Arc<SchemaRegistry>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;
        install_schema(&conn).map_err(sql_err)?;
        let resolver = IdentityResolver::new(Arc::clone(&schemas));
        Ok(Self {
            conn,
            schemas,
            resolver,
            tracked: BTreeSet::new(),
            pending: Vec::new(),
        })
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    // Number of recorded-but-uncommitted mutations. A value-identical merge
    // leaves this at zero.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        let ops = std::mem::take(&mut self.pending);
        self.tracked.clear();
        let tx = self.conn.transaction().map_err(sql_err)?;
        for op in &ops {
            write::apply_op(&tx, op).map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.pending.clear();
        self.tracked.clear();
    }

    // Writes a whole aggregate directly to committed state, bypassing the
    // unit of work. Seeding/import helper: rows and mapped links are written
    // verbatim, associated children get their row upserted but are not
    // descended into.
    pub fn save_tree(&mut self, root: &Entity, tree: &MappingTree) -> Result<(), StoreError> {
        if root.type_name != tree.root_type {
            return Err(StoreError::InvalidInput(
                "root instance type does not match the mapping tree root type",
            ));
        }
        let schemas = Arc::clone(&self.schemas);
        let resolver = self.resolver.clone();
        let tx = self.conn.transaction().map_err(sql_err)?;
        seed_entity(&tx, &schemas, &resolver, root, &tree.children, None)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn exists(&self, type_name: &str, identity: &EntityIdentity) -> Result<bool, StoreError> {
        let ident = ident_key(identity)?;
        self.conn
            .query_row(
                "SELECT 1 FROM entities WHERE type=?1 AND ident=?2",
                params![type_name, ident],
                |_| Ok(()),
            )
            .optional()
            .map_err(sql_err)
            .map(|found| found.is_some())
    }

    pub fn row_count(&self, type_name: &str) -> Result<usize, StoreError> {
        self.conn
            .query_row(
                "SELECT COUNT(1) FROM entities WHERE type=?1",
                params![type_name],
                |row| row.get::<_, i64>(0),
            )
            .map_err(sql_err)
            .map(|count| count as usize)
    }

    pub(crate) fn natural_identity(&self, entity: &Entity) -> Result<EntityIdentity, StoreError> {
        self.resolver.identity_of(entity).map_err(identity_err)
    }

    pub(crate) fn mark_tracked(&mut self, type_name: &str, ident: &str) {
        self.tracked
            .insert((type_name.to_string(), ident.to_string()));
    }

    pub(crate) fn push_op(&mut self, op: PendingOp) {
        self.pending.push(op);
    }

    // Counter bump: read, increment, upsert. The floor raises whenever an
    // explicit key reaches the counter, so generated keys never collide with
    // seeded ones.
    pub(crate) fn next_counter(&mut self, type_name: &str) -> Result<i64, StoreError> {
        let current: i64 = self
            .conn
            .query_row(
                "SELECT value FROM counters WHERE type=?1",
                params![type_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?
            .unwrap_or(0);
        let next = current + 1;
        self.conn
            .execute(
                "INSERT INTO counters(type, value) VALUES (?1, ?2) \
                 ON CONFLICT(type) DO UPDATE SET value=excluded.value",
                params![type_name, next],
            )
            .map_err(sql_err)?;
        Ok(next)
    }
}

impl PersistenceContext for SqliteStore {
    fn find_by_key(
        &mut self,
        type_name: &str,
        identity: &EntityIdentity,
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Option<Entity>, StoreError> {
        self.load_root(type_name, identity, include, mode)
    }

    fn find_many_by_key(
        &mut self,
        type_name: &str,
        identities: &[EntityIdentity],
        include: &[IncludePath],
        mode: LoadMode,
    ) -> Result<Vec<Option<Entity>>, StoreError> {
        self.load_many_roots(type_name, identities, include, mode)
    }

    fn add(&mut self, entity: &mut Entity) -> Result<(), StoreError> {
        self.add_impl(entity)
    }

    fn remove(&mut self, entity: &EntityRef) -> Result<(), StoreError> {
        self.remove_impl(entity)
    }

    fn apply_current_values(
        &mut self,
        target: &mut Entity,
        source: &Entity,
        check_token: bool,
    ) -> Result<(), StoreError> {
        self.apply_impl(target, source, check_token)
    }

    fn attach_and_reload(&mut self, entity: &Entity, reload: bool) -> Result<Entity, StoreError> {
        self.attach_impl(entity, reload)
    }

    fn set_link(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        child: Option<&EntityRef>,
        owned: bool,
    ) -> Result<(), StoreError> {
        self.set_link_impl(parent, relation, child, owned)
    }

    fn replace_links(
        &mut self,
        parent: &EntityRef,
        relation: &str,
        children: &[EntityRef],
        owned: bool,
    ) -> Result<(), StoreError> {
        self.replace_links_impl(parent, relation, children, owned)
    }

    fn required_relations_for(&self, type_name: &str) -> Result<Vec<IncludePath>, StoreError> {
        let schema = self.schemas.expect(type_name).map_err(|_| {
            StoreError::UnknownType(type_name.to_string())
        })?;
        Ok(schema
            .required_relations
            .iter()
            .map(|path| IncludePath::from_dotted(path))
            .collect())
    }

    fn is_tracked(&self, type_name: &str, identity: &EntityIdentity) -> bool {
        match ident_key(identity) {
            Ok(ident) => self.tracked.contains(&(type_name.to_string(), ident)),
            Err(_) => false,
        }
    }
}

fn install_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entities (
          type TEXT NOT NULL,
          ident TEXT NOT NULL,
          fields TEXT NOT NULL,
          PRIMARY KEY (type, ident)
        );

        CREATE TABLE IF NOT EXISTS links (
          parent_type TEXT NOT NULL,
          parent_ident TEXT NOT NULL,
          relation TEXT NOT NULL,
          position INTEGER NOT NULL,
          child_type TEXT NOT NULL,
          child_ident TEXT NOT NULL,
          owned INTEGER NOT NULL,
          PRIMARY KEY (parent_type, parent_ident, relation, child_type, child_ident)
        );

        CREATE INDEX IF NOT EXISTS idx_links_child ON links(child_type, child_ident);

        CREATE TABLE IF NOT EXISTS counters (
          type TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}

pub(crate) fn schema_err(err: gm_core::SchemaError) -> StoreError {
    match err {
        gm_core::SchemaError::UnknownType { type_name } => StoreError::UnknownType(type_name),
        gm_core::SchemaError::UnknownRelation {
            type_name,
            relation,
        } => StoreError::UnknownRelation {
            type_name,
            relation,
        },
        other => StoreError::Backend(Box::new(other)),
    }
}

pub(crate) fn identity_err(err: gm_core::IdentityError) -> StoreError {
    match err {
        gm_core::IdentityError::UnknownType(type_name) => StoreError::UnknownType(type_name),
        gm_core::IdentityError::Empty => {
            StoreError::InvalidInput("entity identity must have at least one component")
        }
    }
}

// Seeding path: upsert the row, rewrite mapped links, recurse into owned
// children only. Back-reference links are written alongside so seeded data
// matches what a merge would have produced.
fn seed_entity(
    tx: &Transaction<'_>,
    schemas: &Arc<SchemaRegistry>,
    resolver: &IdentityResolver,
    entity: &Entity,
    nodes: &[MappingNode],
    back_link: Option<(&str, &LinkEnd)>,
) -> Result<LinkEnd, StoreError> {
    let schema = schemas
        .expect(&entity.type_name)
        .map_err(|_| StoreError::UnknownType(entity.type_name.clone()))?;
    let identity = resolver.identity_of(entity).map_err(identity_err)?;
    let ident = ident_key(&identity)?;
    let fields = fields_to_json(&entity.fields)?;
    write::upsert_row(
        tx,
        &entity.type_name,
        &ident,
        &fields,
        key_floor(&schema.key, &entity.fields),
    )
    .map_err(sql_err)?;
    let this = LinkEnd {
        type_name: entity.type_name.clone(),
        ident,
    };

    if let Some((relation, parent)) = back_link {
        write::replace_relation(tx, &this, relation, std::slice::from_ref(parent), false)
            .map_err(sql_err)?;
    }

    for node in nodes {
        let mut children = Vec::new();
        if node.kind.is_collection() {
            for child in entity.many(&node.accessor) {
                children.push(child);
            }
        } else if let Some(child) = entity.one(&node.accessor) {
            children.push(child);
        }

        let mut ends = Vec::new();
        for child in children {
            let end = if node.kind.is_owned() {
                seed_entity(
                    tx,
                    schemas,
                    resolver,
                    child,
                    &node.children,
                    node.back_reference.as_deref().map(|rel| (rel, &this)),
                )?
            } else {
                // Associated: row only, never descend.
                seed_entity(tx, schemas, resolver, child, &[], None)?
            };
            ends.push(end);
        }
        write::replace_relation(tx, &this, &node.accessor, &ends, node.kind.is_owned())
            .map_err(sql_err)?;
    }

    Ok(this)
}
