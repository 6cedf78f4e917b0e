//! Bundled record store: field catalog, records, values, and terms.

use chrono::Utc;
use enricher_shared::{
    EnricherError, FieldDef, FieldId, FieldKind, FieldValue, RecordId, RecordValues, Result,
    SchemaId, TermId,
};
use libsql::{TransactionBehavior, params};
use uuid::Uuid;

use crate::{Storage, db_err};

impl Storage {
    // -----------------------------------------------------------------------
    // Field catalog
    // -----------------------------------------------------------------------

    /// Insert or update a field definition.
    pub async fn upsert_field(&self, field: &FieldDef) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO fields (id, schema_id, name, kind, multi_valued)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   schema_id = excluded.schema_id,
                   name = excluded.name,
                   kind = excluded.kind,
                   multi_valued = excluded.multi_valued",
                params![
                    field.id.as_str(),
                    field.schema.as_str(),
                    field.name.as_str(),
                    field.kind.as_str(),
                    i64::from(field.multi_valued)
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a field together with its values and terms.
    pub async fn delete_field(&self, field_id: &FieldId) -> Result<()> {
        self.check_writable()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;
        for sql in [
            "DELETE FROM record_values WHERE field_id = ?1",
            "DELETE FROM terms WHERE field_id = ?1",
            "DELETE FROM fields WHERE id = ?1",
        ] {
            tx.execute(sql, params![field_id.as_str()])
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// The whole field catalog.
    pub async fn list_fields(&self) -> Result<Vec<FieldDef>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, schema_id, name, kind, multi_valued FROM fields ORDER BY schema_id, name",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let kind: String = row.get(3).map_err(db_err)?;
            results.push(FieldDef {
                id: FieldId(row.get::<String>(0).map_err(db_err)?),
                schema: SchemaId(row.get::<String>(1).map_err(db_err)?),
                name: row.get::<String>(2).map_err(db_err)?,
                kind: kind.parse::<FieldKind>().map_err(EnricherError::Storage)?,
                multi_valued: row.get::<i64>(4).map_err(db_err)? != 0,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Insert a record if it does not exist yet.
    pub async fn insert_record(&self, id: &RecordId, schema: &SchemaId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO records (id, schema_id, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![id.as_str(), schema.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a record and its values.
    pub async fn delete_record(&self, id: &RecordId) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM record_values WHERE record_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;
        self.conn
            .execute("DELETE FROM records WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Schema of a record, or `None` if the record does not exist.
    pub async fn record_schema(&self, id: &RecordId) -> Result<Option<SchemaId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT schema_id FROM records WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(SchemaId(row.get::<String>(0).map_err(db_err)?))),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Records of one schema, oldest first.
    pub async fn list_records(&self, schema: &SchemaId) -> Result<Vec<RecordId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM records WHERE schema_id = ?1 ORDER BY created_at, id",
                params![schema.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(RecordId(row.get::<String>(0).map_err(db_err)?));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    /// Read one field of a record.
    pub async fn get_value(&self, record: &RecordId, field: &FieldId) -> Result<Option<FieldValue>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value_json FROM record_values WHERE record_id = ?1 AND field_id = ?2",
                params![record.as_str(), field.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(db_err)?;
                Ok(Some(decode_value(&json)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Every stored value of a record.
    pub async fn record_values(&self, record: &RecordId) -> Result<RecordValues> {
        let mut rows = self
            .conn
            .query(
                "SELECT field_id, value_json FROM record_values WHERE record_id = ?1",
                params![record.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut values = RecordValues::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let field = FieldId(row.get::<String>(0).map_err(db_err)?);
            let json: String = row.get(1).map_err(db_err)?;
            values.insert(field, decode_value(&json)?);
        }
        Ok(values)
    }

    /// Write one field of a record (upserts).
    pub async fn set_value(&self, record: &RecordId, field: &FieldId, value: &FieldValue) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(value)
            .map_err(|e| EnricherError::Storage(format!("failed to encode value: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO record_values (record_id, field_id, value_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(record_id, field_id) DO UPDATE SET value_json = excluded.value_json",
                params![record.as_str(), field.as_str(), json.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terms
    // -----------------------------------------------------------------------

    /// Return the canonical term for `label` on `field`, creating it if needed.
    /// Labels match case-insensitively.
    pub async fn ensure_term(&self, field: &FieldId, label: &str) -> Result<TermId> {
        self.check_writable()?;
        let label = label.trim();
        if label.is_empty() {
            return Err(EnricherError::validation("empty term label"));
        }
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO terms (id, field_id, label) VALUES (?1, ?2, ?3)
                 ON CONFLICT(field_id, label) DO NOTHING",
                params![id.as_str(), field.as_str(), label],
            )
            .await
            .map_err(db_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM terms WHERE field_id = ?1 AND label = ?2",
                params![field.as_str(), label],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(TermId(row.get::<String>(0).map_err(db_err)?)),
            Ok(None) => Err(EnricherError::Storage(format!(
                "term '{label}' vanished after insert"
            ))),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Display label of a term.
    pub async fn term_label(&self, term: &TermId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT label FROM terms WHERE id = ?1", params![term.as_str()])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}

fn decode_value(json: &str) -> Result<FieldValue> {
    serde_json::from_str(json)
        .map_err(|e| EnricherError::Storage(format!("invalid stored value {json}: {e}")))
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use enricher_shared::{FieldDef, FieldId, FieldKind, FieldValue, RecordId, SchemaId};

    fn field(id: &str, name: &str, kind: FieldKind, multi: bool) -> FieldDef {
        FieldDef {
            id: FieldId::from(id),
            schema: SchemaId::from("site"),
            name: name.into(),
            kind,
            multi_valued: multi,
        }
    }

    #[tokio::test]
    async fn field_catalog_crud() {
        let storage = test_storage().await;
        storage.upsert_field(&field("f1", "Homepage", FieldKind::Url, false)).await.unwrap();
        storage
            .upsert_field(&field("f2", "Technologies", FieldKind::Enumerable, true))
            .await
            .unwrap();

        let fields = storage.list_fields().await.unwrap();
        assert_eq!(fields.len(), 2);
        assert!(fields.iter().any(|f| f.name == "Technologies" && f.multi_valued));

        storage.delete_field(&FieldId::from("f2")).await.unwrap();
        assert_eq!(storage.list_fields().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_values_roundtrip() {
        let storage = test_storage().await;
        let record = RecordId::from("r1");
        storage.insert_record(&record, &SchemaId::from("site")).await.unwrap();
        assert_eq!(
            storage.record_schema(&record).await.unwrap(),
            Some(SchemaId::from("site"))
        );

        let homepage = FieldId::from("f1");
        storage
            .set_value(&record, &homepage, &FieldValue::Text("https://example.com".into()))
            .await
            .unwrap();
        assert_eq!(
            storage.get_value(&record, &homepage).await.unwrap(),
            Some(FieldValue::Text("https://example.com".into()))
        );
        assert_eq!(storage.record_values(&record).await.unwrap().len(), 1);

        storage.delete_record(&record).await.unwrap();
        assert!(storage.record_schema(&record).await.unwrap().is_none());
        assert!(storage.get_value(&record, &homepage).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_term_reuses_case_insensitively() {
        let storage = test_storage().await;
        let tech = FieldId::from("f2");
        let a = storage.ensure_term(&tech, "WordPress").await.unwrap();
        let b = storage.ensure_term(&tech, "wordpress ").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(storage.term_label(&a).await.unwrap().as_deref(), Some("WordPress"));

        let other = storage.ensure_term(&FieldId::from("f3"), "WordPress").await.unwrap();
        assert_ne!(a, other);
        assert!(storage.ensure_term(&tech, "  ").await.is_err());
    }
}
