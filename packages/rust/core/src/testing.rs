//! Fixtures shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use enricher_shared::{
    Clock, EnricherError, FieldDef, FieldId, FieldKind, FieldValue, ManualClock, RecordId,
    RecordValues, Result as StoreResult, ResultMap, SchemaId, SelectionCriteria, Subject, TermId,
};
use enricher_storage::Storage;
use enricher_transport::{StatusSource, Transport, TransportError};
use uuid::Uuid;

use crate::store::RecordStore;

pub(crate) async fn temp_storage() -> Arc<Storage> {
    let tmp = std::env::temp_dir().join(format!("enricher_core_test_{}.db", Uuid::now_v7()));
    Arc::new(Storage::open(&tmp).await.expect("open test db"))
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub(crate) fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

fn field(id: &str, schema: &str, name: &str, kind: FieldKind, multi: bool) -> FieldDef {
    FieldDef {
        id: FieldId::from(id),
        schema: SchemaId::from(schema),
        name: name.into(),
        kind,
        multi_valued: multi,
    }
}

/// Catalog of a "site" schema with four URL fields and a few destinations,
/// plus an unrelated "article" schema.
pub(crate) fn site_fields() -> Vec<FieldDef> {
    vec![
        field("homepage", "site", "Homepage", FieldKind::Url, false),
        field("docs", "site", "Docs", FieldKind::Url, false),
        field("blog", "site", "Blog", FieldKind::Url, false),
        field("shop", "site", "Shop", FieldKind::Url, false),
        field("report", "site", "Report", FieldKind::File, false),
        field("cms", "site", "Detected CMS", FieldKind::Text, false),
        field("tech", "site", "Technologies", FieldKind::Enumerable, true),
        field("server", "site", "Server", FieldKind::Enumerable, false),
        field("summary", "site", "Summary", FieldKind::Text, false),
        field("title", "article", "Title", FieldKind::Text, false),
    ]
}

pub(crate) async fn seed_site_fields(storage: &Storage) {
    for f in site_fields() {
        storage.upsert_field(&f).await.unwrap();
    }
}

/// Scripted classification service.
///
/// Each call sleeps `latency` on the clock, then answers from `responses`
/// (an empty result map for unknown subjects). With a `rival`, a simulated
/// concurrent process stamps the shared throttle cell after every call.
pub(crate) struct FakeTransport {
    clock: Arc<ManualClock>,
    responses: HashMap<String, Result<ResultMap, TransportError>>,
    latency: Duration,
    rival: Option<(Arc<Storage>, String)>,
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl FakeTransport {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            responses: HashMap::new(),
            latency: Duration::ZERO,
            rival: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(mut self, key: &str, pairs: &[(&str, &[&str])]) -> Self {
        let map = pairs
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect();
        self.responses.insert(key.to_string(), Ok(map));
        self
    }

    pub(crate) fn fail(mut self, key: &str, error: TransportError) -> Self {
        self.responses.insert(key.to_string(), Err(error));
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn with_rival(mut self, storage: Arc<Storage>, throttle_key: &str) -> Self {
        self.rival = Some((storage, throttle_key.to_string()));
        self
    }

    /// Subject keys and dispatch instants, in call order.
    pub(crate) fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, subject: &Subject) -> Result<ResultMap, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((subject.key.clone(), self.clock.now()));
        self.clock.sleep(self.latency).await;

        if let Some((storage, key)) = &self.rival {
            let seen = storage.get_throttle_stamp(key).await.unwrap();
            storage
                .swap_throttle_stamp(key, seen, self.clock.now())
                .await
                .unwrap();
        }

        self.responses
            .get(&subject.key)
            .cloned()
            .unwrap_or_else(|| Ok(ResultMap::new()))
    }
}

/// Status endpoint returning fixed counts; unknown budgets fail.
#[derive(Debug, Default)]
pub(crate) struct FakeStatus {
    pub remaining: HashMap<String, u64>,
    pub asked: Mutex<Vec<String>>,
}

#[async_trait]
impl StatusSource for FakeStatus {
    async fn remaining(&self, budget: &str) -> Result<u64, TransportError> {
        self.asked.lock().unwrap().push(budget.to_string());
        self.remaining
            .get(budget)
            .copied()
            .ok_or_else(|| TransportError::Network("status endpoint unreachable".into()))
    }
}

/// Record store that fails every write to one field.
///
/// `refusing` answers with a validation error, as a host would for a value of
/// the wrong shape; `failing` answers with a storage error.
pub(crate) struct FaultyStore {
    inner: Arc<Storage>,
    field: FieldId,
    refuse: bool,
}

impl FaultyStore {
    pub(crate) fn refusing(inner: Arc<Storage>, field: &str) -> Self {
        Self {
            inner,
            field: FieldId::from(field),
            refuse: true,
        }
    }

    pub(crate) fn failing(inner: Arc<Storage>, field: &str) -> Self {
        Self {
            inner,
            field: FieldId::from(field),
            refuse: false,
        }
    }

    fn fault(&self) -> EnricherError {
        if self.refuse {
            EnricherError::validation("type mismatch")
        } else {
            EnricherError::Storage("disk I/O error".into())
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn search(&self, criteria: &SelectionCriteria) -> StoreResult<Vec<RecordId>> {
        self.inner.search(criteria).await
    }

    async fn schema_of(&self, id: &RecordId) -> StoreResult<Option<SchemaId>> {
        self.inner.schema_of(id).await
    }

    async fn fields(&self) -> StoreResult<Vec<FieldDef>> {
        RecordStore::fields(self.inner.as_ref()).await
    }

    async fn values(&self, id: &RecordId) -> StoreResult<RecordValues> {
        RecordStore::values(self.inner.as_ref(), id).await
    }

    async fn get(&self, id: &RecordId, field: &FieldId) -> StoreResult<Option<FieldValue>> {
        RecordStore::get(self.inner.as_ref(), id, field).await
    }

    async fn set(&self, id: &RecordId, field: &FieldId, value: &FieldValue) -> StoreResult<()> {
        if *field == self.field {
            return Err(self.fault());
        }
        RecordStore::set(self.inner.as_ref(), id, field, value).await
    }

    async fn ensure_term(&self, field: &FieldId, label: &str) -> StoreResult<TermId> {
        if *field == self.field {
            return Err(self.fault());
        }
        RecordStore::ensure_term(self.inner.as_ref(), field, label).await
    }
}
