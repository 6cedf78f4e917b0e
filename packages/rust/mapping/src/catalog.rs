//! Invocation-scoped field lookup.

use std::collections::HashMap;

use enricher_shared::{FieldDef, FieldId, SchemaId};

/// Field definitions indexed by id and by schema-scoped, case-insensitive name.
///
/// Built once per invocation from the record store and passed explicitly to
/// whoever needs it; nothing caches it between runs. Names are only unique
/// within a schema.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    by_id: HashMap<FieldId, FieldDef>,
    by_name: HashMap<(SchemaId, String), FieldId>,
}

impl FieldCatalog {
    pub fn new(fields: impl IntoIterator<Item = FieldDef>) -> Self {
        let mut catalog = Self::default();
        for field in fields {
            catalog
                .by_name
                .insert((field.schema.clone(), name_key(&field.name)), field.id.clone());
            catalog.by_id.insert(field.id.clone(), field);
        }
        catalog
    }

    /// Look a field of `schema` up by display name, ignoring case and
    /// surrounding blanks.
    pub fn by_name(&self, schema: &SchemaId, name: &str) -> Option<&FieldDef> {
        self.by_name
            .get(&(schema.clone(), name_key(name)))
            .and_then(|id| self.by_id.get(id))
    }

    /// Every field with this display name, ordered by schema.
    pub fn named(&self, name: &str) -> Vec<&FieldDef> {
        let key = name_key(name);
        let mut found: Vec<&FieldDef> = self
            .by_name
            .iter()
            .filter(|((_, n), _)| *n == key)
            .filter_map(|(_, id)| self.by_id.get(id))
            .collect();
        found.sort_by(|a, b| a.schema.as_str().cmp(b.schema.as_str()));
        found
    }

    pub fn get(&self, id: &FieldId) -> Option<&FieldDef> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}
