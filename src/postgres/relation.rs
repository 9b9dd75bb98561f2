use std::collections::HashMap;
use tracing::debug;

use super::types::{Oid, RelationSchema};
use crate::{Error, Result};

/// Schemas of the relations seen on the stream, keyed by relation id.
///
/// The server sends a relation message before the first row change for a
/// relation, and again whenever its definition changes. The latest
/// definition always wins.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<Oid, RelationSchema>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `schema`, replacing any previous definition with the same id.
    pub fn put(&mut self, schema: RelationSchema) -> Option<RelationSchema> {
        debug!(
            relation_id = schema.relation_id,
            "RELATION: {}={}.{} ({} columns)",
            schema.relation_id,
            schema.namespace,
            schema.name,
            schema.columns.len()
        );
        self.relations.insert(schema.relation_id, schema)
    }

    /// A missing relation means a row change arrived before its definition,
    /// which the caller must treat as fatal.
    pub fn get(&self, relation_id: Oid) -> Result<&RelationSchema> {
        self.relations
            .get(&relation_id)
            .ok_or(Error::UnknownRelation { relation_id })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
