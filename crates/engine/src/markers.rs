#![forbid(unsafe_code)]

use gm_core::mapping::resolve_back_reference;
use gm_core::{MappingError, MappingNode, MappingTree, NodeKind, SchemaRegistry};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Owned,
    Associated,
}

// Declarative counterpart of a builder relation: marks one relation of one
// owner type. A marker scoped to an aggregate root only applies when merging
// that aggregate and shadows an unscoped marker for the same relation.
#[derive(Clone, Debug, Deserialize)]
pub struct RelationMarker {
    pub relation: String,
    pub ownership: Ownership,
    #[serde(default)]
    pub back_reference: Option<String>,
    #[serde(default)]
    pub aggregate: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MarkerTable {
    #[serde(default)]
    markers: BTreeMap<String, Vec<RelationMarker>>,
}

impl MarkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, type_name: impl Into<String>, marker: RelationMarker) {
        self.markers.entry(type_name.into()).or_default().push(marker);
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub(crate) fn defines(&self, type_name: &str) -> bool {
        self.markers
            .get(type_name)
            .is_some_and(|list| !list.is_empty())
    }

    fn marker_for(
        &self,
        type_name: &str,
        relation: &str,
        root_type: &str,
    ) -> Option<&RelationMarker> {
        let list = self.markers.get(type_name)?;
        list.iter()
            .find(|marker| {
                marker.relation == relation && marker.aggregate.as_deref() == Some(root_type)
            })
            .or_else(|| {
                list.iter()
                    .find(|marker| marker.relation == relation && marker.aggregate.is_none())
            })
    }

    // Derives the mapping tree for one aggregate root by walking the schema's
    // relations and keeping the marked ones. Relations without a marker are
    // left unmapped, associated markers end the walk, and an owned chain that
    // reaches a type already on it is rejected.
    pub fn build(
        &self,
        schemas: &SchemaRegistry,
        root_type: &str,
    ) -> Result<MappingTree, MappingError> {
        if schemas.get(root_type).is_none() {
            return Err(MappingError::UnknownType {
                type_name: root_type.to_string(),
            });
        }
        let mut owned_chain = vec![root_type.to_string()];
        let children = self.build_nodes(schemas, root_type, root_type, &mut owned_chain)?;
        Ok(MappingTree {
            root_type: root_type.to_string(),
            children,
        })
    }

    fn build_nodes(
        &self,
        schemas: &SchemaRegistry,
        type_name: &str,
        root_type: &str,
        owned_chain: &mut Vec<String>,
    ) -> Result<Vec<MappingNode>, MappingError> {
        let schema = schemas.get(type_name).ok_or_else(|| MappingError::UnknownType {
            type_name: type_name.to_string(),
        })?;

        let mut nodes = Vec::new();
        for relation in &schema.relations {
            let Some(marker) = self.marker_for(type_name, &relation.name, root_type) else {
                continue;
            };
            let owned = marker.ownership == Ownership::Owned;
            let target = relation.target_type.clone();

            let (back_reference, children) = if owned {
                if owned_chain.iter().any(|ancestor| ancestor == &target) {
                    return Err(MappingError::OwnedCycle { type_name: target });
                }
                let back_reference = resolve_back_reference(
                    schemas,
                    &target,
                    type_name,
                    marker.back_reference.as_deref(),
                )?;
                owned_chain.push(target.clone());
                let children = self.build_nodes(schemas, &target, root_type, owned_chain)?;
                owned_chain.pop();
                (back_reference, children)
            } else {
                // kept only when declared explicitly; set on attach
                let back_reference = match marker.back_reference.as_deref() {
                    Some(path) => {
                        resolve_back_reference(schemas, &target, type_name, Some(path))?
                    }
                    None => None,
                };
                (back_reference, Vec::new())
            };

            nodes.push(MappingNode {
                accessor: relation.name.clone(),
                target_type: target,
                kind: NodeKind::for_relation(owned, relation.many),
                back_reference,
                children,
            });
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gm_core::{EntitySchema, RelationSchema};

    fn schemas() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .define_all([
                EntitySchema {
                    type_name: "Company".to_string(),
                    key: vec!["Id".to_string()],
                    alternate_key: None,
                    concurrency_token: None,
                    relations: vec![
                        RelationSchema {
                            name: "Contacts".to_string(),
                            target_type: "Contact".to_string(),
                            many: true,
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
                    type_name: "Manager".to_string(),
                    key: vec!["Id".to_string()],
                    alternate_key: None,
                    concurrency_token: None,
                    relations: Vec::new(),
                    required_relations: Vec::new(),
                },
            ])
            .unwrap();
        registry
    }

    #[test]
    fn yaml_markers_build_a_tree() {
        let table = MarkerTable::from_yaml(
            r#"
markers:
  Company:
    - relation: Contacts
      ownership: owned
    - relation: Auditor
      ownership: associated
"#,
        )
        .unwrap();

        let tree = table.build(&schemas(), "Company").unwrap();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].kind, NodeKind::OwnedCollection);
        assert_eq!(tree.children[0].back_reference.as_deref(), Some("Company"));
        assert_eq!(tree.children[1].kind, NodeKind::AssociatedEntity);
    }

    #[test]
    fn aggregate_scoped_marker_shadows_the_unscoped_one() {
        let mut table = MarkerTable::new();
        table.mark(
            "Company",
            RelationMarker {
                relation: "Auditor".to_string(),
                ownership: Ownership::Owned,
                back_reference: None,
                aggregate: None,
            },
        );
        table.mark(
            "Company",
            RelationMarker {
                relation: "Auditor".to_string(),
                ownership: Ownership::Associated,
                back_reference: None,
                aggregate: Some("Company".to_string()),
            },
        );

        let tree = table.build(&schemas(), "Company").unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].kind, NodeKind::AssociatedEntity);
    }

    #[test]
    fn owned_marker_cycles_are_rejected() {
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
        table.mark(
            "Contact",
            RelationMarker {
                relation: "Company".to_string(),
                ownership: Ownership::Owned,
                back_reference: None,
                aggregate: None,
            },
        );

        let err = table.build(&schemas(), "Company").unwrap_err();
        assert_eq!(
            err,
            MappingError::OwnedCycle {
                type_name: "Company".to_string(),
            }
        );
    }

    #[test]
    fn associated_marker_keeps_its_explicit_back_reference() {
        let mut table = MarkerTable::new();
        table.mark(
            "Company",
            RelationMarker {
                relation: "Contacts".to_string(),
                ownership: Ownership::Associated,
                back_reference: Some("Company".to_string()),
                aggregate: None,
            },
        );

        let tree = table.build(&schemas(), "Company").unwrap();
        assert_eq!(tree.children[0].kind, NodeKind::AssociatedCollection);
        assert_eq!(tree.children[0].back_reference.as_deref(), Some("Company"));
    }

    #[test]
    fn unmarked_relations_stay_unmapped() {
        let table = MarkerTable::new();
        let tree = table.build(&schemas(), "Company").unwrap();
        assert!(tree.children.is_empty());
    }
}
