//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use rust_decimal::Decimal;
use time::macros::date;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::IntakeConfig;
use crate::error::Result;
use crate::extraction::{ExtractedInvoice, ExtractionFailure, Extractor};
use crate::intake::IntakePipeline;
use crate::model::{Category, IntakeStatus, InvoiceDocument, Report, ReportStatus};
use crate::storage::{BlobStorage, StorageError, content_fingerprint};
use crate::store::{Store, categories, now};

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// A fresh INBOX document with a stored file.
pub fn new_document(filename: &str, fingerprint: &str) -> InvoiceDocument {
    let created_at = now();
    InvoiceDocument {
        id: Uuid::new_v4(),
        fingerprint: fingerprint.to_string(),
        filename: filename.to_string(),
        storage_handle: Some(format!("{fingerprint}.pdf")),
        carrier: None,
        invoice_number: None,
        due_date: None,
        total_value: None,
        confidence_score: 0,
        status: IntakeStatus::Inbox,
        error_code: None,
        error_message: None,
        duplicate_of: None,
        revision: 1,
        created_at,
        updated_at: created_at,
    }
}

pub fn seed_category(conn: &Connection, name: &str) -> Result<Category> {
    categories::get_or_create(conn, name)
}

/// A manually entered PENDING report.
pub fn new_report(category_id: Uuid, total_value: Decimal) -> Report {
    let created_at = now();
    Report {
        id: Uuid::new_v4(),
        title: "INVOICE TEST".to_string(),
        reference_date: created_at.date(),
        due_date: None,
        category_id,
        total_value,
        status: ReportStatus::Pending,
        invoice_source_id: None,
        confidence_score: None,
        requires_attention: false,
        created_at,
        updated_at: created_at,
    }
}

/// Extraction result for a VIVO invoice with every field but the total fixed.
pub fn extracted(score: u8, total: Option<&str>) -> ExtractedInvoice {
    ExtractedInvoice {
        carrier: Some("VIVO".to_string()),
        invoice_number: Some("123456789".to_string()),
        due_date: Some(date!(2026 - 01 - 10)),
        total_value: total.map(dec),
        confidence_score: score,
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn store(&self, bytes: &[u8]) -> std::result::Result<String, StorageError> {
        let handle = format!("{}.pdf", content_fingerprint(bytes));
        self.blobs
            .lock()
            .unwrap()
            .insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }

    async fn retrieve(&self, handle: &str) -> std::result::Result<Vec<u8>, StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| StorageError::Missing(handle.to_string()))
    }

    async fn delete(&self, handle: &str) -> std::result::Result<(), StorageError> {
        self.blobs.lock().unwrap().remove(handle);
        Ok(())
    }
}

enum Script {
    Outcomes(Vec<std::result::Result<ExtractedInvoice, ExtractionFailure>>),
    Hang,
}

/// Extractor that replays canned outcomes. The last outcome repeats.
pub struct ScriptedExtractor {
    script: Mutex<Script>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedExtractor {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    pub fn returning(invoice: ExtractedInvoice) -> Arc<Self> {
        Self::with(Script::Outcomes(vec![Ok(invoice)]))
    }

    pub fn hanging() -> Arc<Self> {
        Self::with(Script::Hang)
    }

    pub fn sequence(
        outcomes: Vec<std::result::Result<ExtractedInvoice, ExtractionFailure>>,
    ) -> Arc<Self> {
        assert!(!outcomes.is_empty());
        Self::with(Script::Outcomes(outcomes))
    }

    /// Make the next call wait until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<std::result::Result<ExtractedInvoice, ExtractionFailure>> {
        let mut script = self.script.lock().unwrap();
        match &mut *script {
            Script::Hang => None,
            Script::Outcomes(outcomes) if outcomes.len() > 1 => Some(outcomes.remove(0)),
            Script::Outcomes(outcomes) => Some(outcomes[0].clone()),
        }
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        _bytes: &[u8],
    ) -> std::result::Result<ExtractedInvoice, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.next() {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }
}

pub fn pipeline(
    extractor: Arc<ScriptedExtractor>,
    config: IntakeConfig,
) -> (Arc<Store>, IntakePipeline) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let pipeline = IntakePipeline::new(
        Arc::clone(&store),
        Arc::new(MemoryStorage::default()),
        extractor,
        config,
    );
    (store, pipeline)
}
