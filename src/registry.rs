//! C9: runtime metadata — cascade-delete relations and foreign-key
//! relations, keyed by model-type string per the redesign flag in §9
//! (explicit constants generated alongside per-model code, not runtime
//! reflection).

use std::collections::HashMap;

/// A declared `OneToMany`/cascade-delete edge from a parent model to a
/// child model (§4.7).
#[derive(Debug, Clone)]
pub struct CascadeDeleteRelation {
    pub field_name: String,
    pub target_type: String,
    /// The child's foreign-key field that references the parent's id.
    pub mapped_by: String,
}

/// A declared foreign-key edge used by ID negotiation's atomic replacement
/// (§4.6): rows of `source_type` carry an `fk_column` field referencing
/// `target_type`'s id.
#[derive(Debug, Clone)]
pub struct ForeignKeyRelation {
    pub source_type: String,
    pub fk_column: String,
    pub target_type: String,
}

#[derive(Default)]
pub struct ModelInfoRegistry {
    cascade_relations: HashMap<String, Vec<CascadeDeleteRelation>>,
    fk_relations: HashMap<String, Vec<ForeignKeyRelation>>,
}

impl ModelInfoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cascade_delete(&mut self, parent_type: impl Into<String>, relation: CascadeDeleteRelation) {
        self.cascade_relations.entry(parent_type.into()).or_default().push(relation);
    }

    pub fn register_foreign_key(&mut self, referenced_type: impl Into<String>, relation: ForeignKeyRelation) {
        self.fk_relations.entry(referenced_type.into()).or_default().push(relation);
    }

    pub fn cascade_delete_relations(&self, model_type: &str) -> &[CascadeDeleteRelation] {
        self.cascade_relations.get(model_type).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// FK relations that reference `model_type`'s id (used by §4.6's FK
    /// pre/post-validation and the `ForeignKeyUpdateService`).
    pub fn foreign_key_relations(&self, model_type: &str) -> &[ForeignKeyRelation] {
        self.fk_relations.get(model_type).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_relations_by_type_name() {
        let mut registry = ModelInfoRegistry::new();
        registry.register_cascade_delete(
            "Project",
            CascadeDeleteRelation { field_name: "tasks".into(), target_type: "Task".into(), mapped_by: "project_id".into() },
        );
        registry.register_foreign_key(
            "Project",
            ForeignKeyRelation { source_type: "Task".into(), fk_column: "project_id".into(), target_type: "Project".into() },
        );

        assert_eq!(registry.cascade_delete_relations("Project").len(), 1);
        assert_eq!(registry.foreign_key_relations("Project").len(), 1);
        assert!(registry.cascade_delete_relations("User").is_empty());
    }
}
