//! Persisting mapping writes through the record store.

use enricher_mapping::{ApplyOutcome, FieldWrite, PendingValue};
use enricher_shared::{EnricherError, FieldValue, RecordId, RecordValues, Result, TermId};
use tracing::{debug, warn};

use crate::store::RecordStore;

/// What [`persist`] did with one [`ApplyOutcome`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    /// Fields that changed.
    pub written: usize,
    /// Assignments skipped because the value did not fit the field, whether
    /// the mapping or the record store refused it.
    pub rejected: usize,
}

/// Persist `outcome` for `record`.
///
/// `existing` is the record's view as of the last read and is updated in
/// place, so several subjects of one record never overwrite each other.
/// A value is only written into an unset field; multi-valued term fields
/// gain terms but never lose any. A validation failure from the store skips
/// that one field; any other error is returned.
pub async fn persist(
    store: &dyn RecordStore,
    record: &RecordId,
    outcome: &ApplyOutcome,
    existing: &mut RecordValues,
) -> Result<WriteCounts> {
    let mut counts = WriteCounts {
        written: 0,
        rejected: outcome.rejected.len(),
    };
    for rejection in &outcome.rejected {
        warn!(
            record_id = %record,
            field = %rejection.field_name,
            reason = %rejection.reason,
            "result does not fit field, skipped"
        );
    }

    for write in &outcome.writes {
        let current = existing.get(&write.field).filter(|v| v.is_set());
        match write_field(store, record, write, current).await {
            Ok(Some(value)) => {
                debug!(record_id = %record, field = %write.field_name, "field written");
                existing.insert(write.field.clone(), value);
                counts.written += 1;
            }
            Ok(None) => {}
            Err(EnricherError::Validation { message }) => {
                warn!(
                    record_id = %record,
                    field = %write.field_name,
                    reason = %message,
                    "record store refused value, skipped"
                );
                counts.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(counts)
}

/// Write one field, returning the stored value or `None` when nothing changed.
async fn write_field(
    store: &dyn RecordStore,
    record: &RecordId,
    write: &FieldWrite,
    current: Option<&FieldValue>,
) -> Result<Option<FieldValue>> {
    let value = match &write.value {
        PendingValue::Value(value) => {
            if current.is_some() {
                return Ok(None);
            }
            value.clone()
        }
        PendingValue::Terms { labels, merge } => {
            if current.is_some() && !merge {
                return Ok(None);
            }
            let mut terms: Vec<TermId> = match current {
                Some(FieldValue::Terms(ids)) => ids.clone(),
                _ => Vec::new(),
            };
            let before = terms.len();
            for label in labels {
                let term = store.ensure_term(&write.field, label).await?;
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
            if terms.len() == before {
                return Ok(None);
            }
            FieldValue::Terms(terms)
        }
    };
    store.set(record, &write.field, &value).await?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FaultyStore, seed_site_fields, temp_storage};
    use enricher_mapping::WriteRejection;
    use enricher_shared::{FieldId, SchemaId};

    fn write(field: &str, value: PendingValue) -> FieldWrite {
        FieldWrite {
            field: FieldId::from(field),
            field_name: field.into(),
            value,
        }
    }

    fn terms(labels: &[&str], merge: bool) -> PendingValue {
        PendingValue::Terms {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            merge,
        }
    }

    #[tokio::test]
    async fn writes_are_additive_only() {
        let storage = temp_storage().await;
        seed_site_fields(&storage).await;
        let record = RecordId::from("r1");
        storage.insert_record(&record, &SchemaId::from("site")).await.unwrap();

        let nginx = storage.ensure_term(&FieldId::from("tech"), "nginx").await.unwrap();
        storage
            .set(&record, &FieldId::from("cms"), &FieldValue::Text("Ghost".into()))
            .await
            .unwrap();
        storage
            .set(&record, &FieldId::from("tech"), &FieldValue::Terms(vec![nginx.clone()]))
            .await
            .unwrap();
        let mut existing = storage.values(&record).await.unwrap();

        let outcome = ApplyOutcome {
            writes: vec![
                write("cms", PendingValue::Value(FieldValue::Text("WordPress".into()))),
                write("tech", terms(&["NGINX", "PHP"], true)),
                write("server", terms(&["Apache"], false)),
                write("summary", PendingValue::Value(FieldValue::Text("A shop".into()))),
            ],
            rejected: vec![WriteRejection {
                field: FieldId::from("title"),
                field_name: "Title".into(),
                reason: "wrong schema".into(),
            }],
        };

        let counts = persist(storage.as_ref(), &record, &outcome, &mut existing)
            .await
            .unwrap();
        assert_eq!(counts, WriteCounts { written: 3, rejected: 1 });

        let values = storage.values(&record).await.unwrap();
        assert_eq!(values[&FieldId::from("cms")], FieldValue::Text("Ghost".into()));
        let FieldValue::Terms(tech) = &values[&FieldId::from("tech")] else {
            panic!("tech should hold terms");
        };
        assert_eq!(tech.len(), 2);
        assert_eq!(tech[0], nginx);
        assert_eq!(existing, values);

        // A second pass changes nothing.
        let again = persist(storage.as_ref(), &record, &outcome, &mut existing)
            .await
            .unwrap();
        assert_eq!(again.written, 0);
    }

    #[tokio::test]
    async fn refused_field_does_not_block_its_siblings() {
        let storage = temp_storage().await;
        seed_site_fields(&storage).await;
        let record = RecordId::from("r1");
        storage.insert_record(&record, &SchemaId::from("site")).await.unwrap();
        let store = FaultyStore::refusing(storage.clone(), "cms");
        let mut existing = RecordValues::new();

        let outcome = ApplyOutcome {
            writes: vec![
                write("cms", PendingValue::Value(FieldValue::Text("WordPress".into()))),
                write("tech", terms(&["PHP"], true)),
            ],
            rejected: Vec::new(),
        };
        let counts = persist(&store, &record, &outcome, &mut existing).await.unwrap();

        assert_eq!(counts, WriteCounts { written: 1, rejected: 1 });
        let values = storage.values(&record).await.unwrap();
        assert!(!values.contains_key(&FieldId::from("cms")));
        assert!(values.contains_key(&FieldId::from("tech")));
    }

    #[tokio::test]
    async fn storage_failures_still_propagate() {
        let storage = temp_storage().await;
        seed_site_fields(&storage).await;
        let record = RecordId::from("r1");
        storage.insert_record(&record, &SchemaId::from("site")).await.unwrap();
        let store = FaultyStore::failing(storage.clone(), "cms");

        let outcome = ApplyOutcome {
            writes: vec![write("cms", PendingValue::Value(FieldValue::Text("WordPress".into())))],
            rejected: Vec::new(),
        };
        let err = persist(&store, &record, &outcome, &mut RecordValues::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnricherError::Storage(_)));
    }
}
