#![forbid(unsafe_code)]

use gm_core::mapping::{relation_target, resolve_back_reference};
use gm_core::{MappingError, MappingNode, MappingTree, NodeKind, SchemaRegistry};

// One relation declaration in a fluent mapping. Nothing is validated until
// `MappingBuilder::build`, which resolves every declaration against the
// schema in one pass.
#[derive(Clone, Debug)]
pub struct RelationDecl {
    accessor: String,
    owned: bool,
    many: bool,
    back_reference: Option<String>,
    children: Vec<RelationDecl>,
}

impl RelationDecl {
    fn new(accessor: impl Into<String>, owned: bool, many: bool) -> Self {
        Self {
            accessor: accessor.into(),
            owned,
            many,
            back_reference: None,
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: RelationDecl) -> Self {
        self.children.push(child);
        self
    }

    pub fn back_reference(mut self, path: impl Into<String>) -> Self {
        self.back_reference = Some(path.into());
        self
    }
}

pub fn owned(accessor: impl Into<String>) -> RelationDecl {
    RelationDecl::new(accessor, true, false)
}

pub fn associated(accessor: impl Into<String>) -> RelationDecl {
    RelationDecl::new(accessor, false, false)
}

pub fn owned_many(accessor: impl Into<String>) -> RelationDecl {
    RelationDecl::new(accessor, true, true)
}

pub fn associated_many(accessor: impl Into<String>) -> RelationDecl {
    RelationDecl::new(accessor, false, true)
}

#[derive(Clone, Debug)]
pub struct MappingBuilder {
    root_type: String,
    relations: Vec<RelationDecl>,
}

impl MappingBuilder {
    pub fn for_root(root_type: impl Into<String>) -> Self {
        Self {
            root_type: root_type.into(),
            relations: Vec::new(),
        }
    }

    pub fn relation(mut self, decl: RelationDecl) -> Self {
        self.relations.push(decl);
        self
    }

    pub fn build(self, schemas: &SchemaRegistry) -> Result<MappingTree, MappingError> {
        if schemas.get(&self.root_type).is_none() {
            return Err(MappingError::UnknownType {
                type_name: self.root_type.clone(),
            });
        }
        let children = build_nodes(schemas, &self.root_type, &self.relations)?;
        Ok(MappingTree {
            root_type: self.root_type,
            children,
        })
    }
}

// A fluent declaration tree is finite by construction, so owned self-typed
// relations are allowed here; only the schema-driven marker walk needs cycle
// detection.
fn build_nodes(
    schemas: &SchemaRegistry,
    parent_type: &str,
    decls: &[RelationDecl],
) -> Result<Vec<MappingNode>, MappingError> {
    let mut nodes = Vec::with_capacity(decls.len());
    for decl in decls {
        let target = relation_target(schemas, parent_type, &decl.accessor, decl.many)?;
        if !decl.owned && !decl.children.is_empty() {
            return Err(MappingError::NestedUnderAssociated {
                type_name: parent_type.to_string(),
                property: decl.accessor.clone(),
            });
        }

        let (back_reference, children) = if decl.owned {
            let back_reference = resolve_back_reference(
                schemas,
                &target,
                parent_type,
                decl.back_reference.as_deref(),
            )?;
            let children = build_nodes(schemas, &target, &decl.children)?;
            (back_reference, children)
        } else {
            // associated relations never infer a back-reference, but an
            // explicit one is validated and kept so it can be set on attach
            let back_reference = match decl.back_reference.as_deref() {
                Some(path) => resolve_back_reference(schemas, &target, parent_type, Some(path))?,
                None => None,
            };
            (back_reference, Vec::new())
        };

        nodes.push(MappingNode {
            accessor: decl.accessor.clone(),
            target_type: target,
            kind: NodeKind::for_relation(decl.owned, decl.many),
            back_reference,
            children,
        });
    }
    Ok(nodes)
}
