//! Record store seam.
//!
//! Candidate selection, subject extraction, and field writes only go through
//! [`RecordStore`]. The bundled libSQL tables implement it; a host with its
//! own record storage can plug in another implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use enricher_mapping::FieldCatalog;
use enricher_shared::{
    FieldDef, FieldId, FieldValue, RecordId, RecordValues, Result, SchemaId, SelectionCriteria,
    TermId,
};
use enricher_storage::Storage;
use tracing::warn;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records matching the selection criteria, oldest first.
    async fn search(&self, criteria: &SelectionCriteria) -> Result<Vec<RecordId>>;

    /// Schema of a record, or `None` once the record is gone.
    async fn schema_of(&self, id: &RecordId) -> Result<Option<SchemaId>>;

    /// The current field catalog.
    async fn fields(&self) -> Result<Vec<FieldDef>>;

    /// All values of a record.
    async fn values(&self, id: &RecordId) -> Result<RecordValues>;

    async fn get(&self, id: &RecordId, field: &FieldId) -> Result<Option<FieldValue>>;

    async fn set(&self, id: &RecordId, field: &FieldId, value: &FieldValue) -> Result<()>;

    /// Canonical term for `label` on an enumerable field, created on demand.
    async fn ensure_term(&self, field: &FieldId, label: &str) -> Result<TermId>;
}

#[async_trait]
impl RecordStore for Storage {
    async fn search(&self, criteria: &SelectionCriteria) -> Result<Vec<RecordId>> {
        let catalog = if criteria.missing_fields.is_empty() {
            FieldCatalog::default()
        } else {
            FieldCatalog::new(self.list_fields().await?)
        };
        for name in &criteria.missing_fields {
            if catalog.named(name).is_empty() {
                warn!(field = %name, "selection names an unknown field, ignoring it");
            }
        }

        let limit = criteria.limit.unwrap_or(usize::MAX);
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for schema in &criteria.schemas {
            // Names resolve per schema; a schema with none of them is skipped.
            let required: Vec<&FieldId> = criteria
                .missing_fields
                .iter()
                .filter_map(|name| catalog.by_name(schema, name))
                .map(|field| &field.id)
                .collect();
            if !criteria.missing_fields.is_empty() && required.is_empty() {
                continue;
            }

            for id in self.list_records(schema).await? {
                if found.len() >= limit {
                    return Ok(found);
                }
                if !seen.insert(id.clone()) {
                    continue;
                }
                if !required.is_empty() {
                    let values = self.record_values(&id).await?;
                    let missing_any = required
                        .iter()
                        .any(|f| !values.get(*f).is_some_and(FieldValue::is_set));
                    if !missing_any {
                        continue;
                    }
                }
                found.push(id);
            }
        }
        Ok(found)
    }

    async fn schema_of(&self, id: &RecordId) -> Result<Option<SchemaId>> {
        self.record_schema(id).await
    }

    async fn fields(&self) -> Result<Vec<FieldDef>> {
        self.list_fields().await
    }

    async fn values(&self, id: &RecordId) -> Result<RecordValues> {
        self.record_values(id).await
    }

    async fn get(&self, id: &RecordId, field: &FieldId) -> Result<Option<FieldValue>> {
        self.get_value(id, field).await
    }

    async fn set(&self, id: &RecordId, field: &FieldId, value: &FieldValue) -> Result<()> {
        self.set_value(id, field, value).await
    }

    async fn ensure_term(&self, field: &FieldId, label: &str) -> Result<TermId> {
        Storage::ensure_term(self, field, label).await
    }
}
