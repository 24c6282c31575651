//! Invoice intake: upload, duplicate suppression, background extraction,
//! confidence routing and the human confirm step.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::bridge;
use crate::config::IntakeConfig;
use crate::error::{Result, WorkflowError};
use crate::extraction::{
    EXTRACTION_TIMEOUT, ExtractedInvoice, ExtractionFailure, Extractor, REPORT_LOCKED,
    STORAGE_UNAVAILABLE,
};
use crate::governance;
use crate::model::{Confirmation, IntakeStatus, InvoiceDocument, InvoiceFields, Report};
use crate::reconciler::IntakeQueue;
use crate::scanner;
use crate::storage::{BlobStorage, StorageError, content_fingerprint};
use crate::store::documents::{self, Claim};
use crate::store::{Store, now, reports};

/// Document score once a reviewer has corrected extracted fields.
pub const CORRECTED_CONFIDENCE: u8 = 30;

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Carrier known from context (folder, mailbox); used when extraction
    /// finds none.
    pub carrier_hint: Option<String>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            carrier_hint: None,
        }
    }

    pub fn with_carrier_hint(mut self, carrier: impl Into<String>) -> Self {
        self.carrier_hint = Some(carrier.into());
        self
    }
}

/// Handle on a background extraction run.
#[derive(Debug)]
pub struct ExtractionTask {
    pub document_id: Uuid,
    handle: JoinHandle<Result<InvoiceDocument>>,
}

impl ExtractionTask {
    /// Wait for the run to settle and return the document as it ended up.
    pub async fn wait(self) -> Result<InvoiceDocument> {
        self.handle
            .await
            .map_err(|e| WorkflowError::TransientIo(format!("extraction task aborted: {e}")))?
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Stored and queued for extraction.
    Accepted {
        document: InvoiceDocument,
        extraction: ExtractionTask,
    },
    /// Same bytes as a live document; recorded as skipped, nothing else runs.
    AlreadyImported {
        document: InvoiceDocument,
        existing: Uuid,
    },
}

impl SubmitOutcome {
    pub fn document(&self) -> &InvoiceDocument {
        match self {
            SubmitOutcome::Accepted { document, .. } => document,
            SubmitOutcome::AlreadyImported { document, .. } => document,
        }
    }
}

/// A document's file as it was uploaded.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Whether the reviewer changed what extraction produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Confirmed,
    Corrected,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub document: InvoiceDocument,
    pub report: Report,
    /// False when a previously linked report was updated.
    pub created: bool,
    pub review: ReviewOutcome,
    /// The total is zero; the report is flagged for attention.
    pub requires_attention: bool,
}

/// Owns every automated document transition. Cheap to clone; background
/// tasks hold their own copy.
#[derive(Clone)]
pub struct IntakePipeline {
    store: Arc<Store>,
    storage: Arc<dyn BlobStorage>,
    extractor: Arc<dyn Extractor>,
    config: IntakeConfig,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Normalised, validated review input.
fn validate_fields(fields: InvoiceFields) -> Result<InvoiceFields> {
    let carrier = clean(fields.carrier)
        .map(|c| c.to_uppercase())
        .ok_or_else(|| WorkflowError::validation("carrier is required"))?;
    let total_value = fields
        .total_value
        .ok_or_else(|| WorkflowError::validation("total value is required"))?;
    if total_value < Decimal::ZERO {
        return Err(WorkflowError::validation("total value cannot be negative"));
    }
    Ok(InvoiceFields {
        carrier: Some(carrier),
        invoice_number: clean(fields.invoice_number),
        total_value: Some(total_value),
        due_date: fields.due_date,
    })
}

impl IntakePipeline {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn BlobStorage>,
        extractor: Arc<dyn Extractor>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            store,
            storage,
            extractor,
            config,
        }
    }

    /// Accept an upload. Returns as soon as the document is recorded;
    /// extraction continues in the background.
    pub async fn submit(&self, upload: Upload) -> Result<SubmitOutcome> {
        let filename = upload.filename.trim().to_string();
        if filename.is_empty() {
            return Err(WorkflowError::validation("filename is required"));
        }
        if upload.bytes.is_empty() {
            return Err(WorkflowError::validation("uploaded file is empty"));
        }

        let fingerprint = content_fingerprint(&upload.bytes);
        let created_at = now();
        let mut doc = InvoiceDocument {
            id: Uuid::new_v4(),
            fingerprint,
            filename,
            storage_handle: None,
            carrier: clean(upload.carrier_hint).map(|c| c.to_uppercase()),
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
        };

        // known duplicates never touch storage; the claim below still
        // decides races between simultaneous uploads
        let known = self
            .store
            .read(|conn| documents::find_active_by_fingerprint(conn, &doc.fingerprint))?;
        if known.is_none() {
            doc.storage_handle = Some(self.storage.store(&upload.bytes).await?);
        }

        match self.store.write(|tx| documents::claim(tx, doc))? {
            Claim::Duplicate { document, existing } => {
                info!(
                    id = %document.id,
                    existing = %existing,
                    filename = %document.filename,
                    "Already imported"
                );
                Ok(SubmitOutcome::AlreadyImported { document, existing })
            }
            Claim::Fresh(document) => {
                let pipeline = self.clone();
                let id = document.id;
                let handle = tokio::spawn(async move { pipeline.run_extraction(id).await });
                Ok(SubmitOutcome::Accepted {
                    document,
                    extraction: ExtractionTask {
                        document_id: id,
                        handle,
                    },
                })
            }
        }
    }

    /// Submit every PDF filed under `root` as `Year/City/Carrier/Month/*.pdf`,
    /// with the carrier folder as the hint. Unreadable or empty files are
    /// logged and left out.
    pub async fn import_folder(&self, root: impl AsRef<Path>) -> Result<Vec<SubmitOutcome>> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(WorkflowError::validation(format!(
                "import folder not found: {}",
                root.display()
            )));
        }

        let scan_root = root.clone();
        let found = tokio::task::spawn_blocking(move || scanner::scan(&scan_root))
            .await
            .map_err(|e| WorkflowError::TransientIo(format!("folder scan aborted: {e}")))?
            .map_err(|e| WorkflowError::TransientIo(format!("folder scan failed: {e}")))?;
        info!(root = %root.display(), files = found.len(), "Import folder scanned");

        let mut outcomes = Vec::with_capacity(found.len());
        for invoice in found {
            let bytes = match tokio::fs::read(&invoice.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        path = %invoice.path.display(),
                        error = %e,
                        "Unreadable file left out of import"
                    );
                    continue;
                }
            };
            let upload = Upload::new(invoice.filename, bytes).with_carrier_hint(invoice.carrier);
            match self.submit(upload).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_validation() => {
                    warn!(path = %invoice.path.display(), error = %e, "File left out of import");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    async fn run_extraction(self, id: Uuid) -> Result<InvoiceDocument> {
        let claimed = self.store.write(|tx| {
            documents::transition(tx, id, &[IntakeStatus::Inbox], IntakeStatus::Processing)
        })?;
        match claimed {
            Some(_) => self.extract_claimed(id).await,
            // already picked up elsewhere
            None => self.store.read(|conn| documents::require(conn, id)),
        }
    }

    /// Extraction for a document already moved to `PROCESSING`.
    async fn extract_claimed(self, id: Uuid) -> Result<InvoiceDocument> {
        let span = info_span!("extraction", document = %id);
        let pipeline = self;
        async move {
            let doc = pipeline.store.read(|conn| documents::require(conn, id))?;

            let bytes = match &doc.storage_handle {
                Some(handle) => pipeline.storage.retrieve(handle).await.map_err(|e| {
                    ExtractionFailure::new(STORAGE_UNAVAILABLE, e)
                }),
                None => Err(ExtractionFailure::new(
                    STORAGE_UNAVAILABLE,
                    "stored file was purged",
                )),
            };
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(failure) => {
                    return pipeline.finish(id, IntakeStatus::Processing, Err(failure));
                }
            };

            let running = pipeline.store.write(|tx| {
                documents::transition(
                    tx,
                    id,
                    &[IntakeStatus::Processing],
                    IntakeStatus::OcrRunning,
                )
            })?;
            if running.is_none() {
                warn!("Document left PROCESSING before extraction started");
                return pipeline.store.read(|conn| documents::require(conn, id));
            }

            let limit = pipeline.config.extraction_timeout();
            let result = match tokio::time::timeout(limit, pipeline.extractor.extract(&bytes)).await
            {
                Ok(result) => result,
                Err(_) => Err(ExtractionFailure::timeout(limit)),
            };
            pipeline.finish(id, IntakeStatus::OcrRunning, result)
        }
        .instrument(span)
        .await
    }

    /// Where an extraction result goes. Auto-accept needs a positive total
    /// and a due date on top of the score.
    fn route(&self, extracted: &ExtractedInvoice) -> IntakeStatus {
        let has_total = extracted.total_value.is_some_and(|v| v > Decimal::ZERO);
        let complete = has_total && extracted.due_date.is_some();
        if extracted.confidence_score >= self.config.auto_accept_threshold && complete {
            IntakeStatus::Success
        } else {
            IntakeStatus::PendingReview
        }
    }

    /// Record the outcome of an extraction run. Only applies while the
    /// document is still in `expected`, so a late result after a timeout or
    /// a stalled-job rescue changes nothing.
    fn finish(
        &self,
        id: Uuid,
        expected: IntakeStatus,
        result: std::result::Result<ExtractedInvoice, ExtractionFailure>,
    ) -> Result<InvoiceDocument> {
        self.store.write(|tx| {
            let mut doc = documents::require(tx, id)?;
            if doc.status != expected {
                warn!(status = %doc.status, "Extraction result discarded, document moved on");
                return Ok(doc);
            }

            match result {
                Err(failure) => {
                    doc.status = IntakeStatus::Failed;
                    doc.error_code = Some(failure.code.to_string());
                    doc.error_message = Some(failure.message.clone());
                    let doc = documents::update(tx, &doc)?;
                    error!(code = failure.code, message = %failure.message, "Extraction failed");
                    self.fail_linked_report(tx, &doc)?;
                    Ok(doc)
                }
                Ok(extracted) => {
                    let status = self.route(&extracted);
                    if status == IntakeStatus::Success {
                        if let Some(report) = reports::find_by_source(tx, id)? {
                            // approved or canceled while the rerun was in flight
                            if report.status.is_terminal() {
                                doc.status = IntakeStatus::Failed;
                                doc.error_code = Some(REPORT_LOCKED.to_string());
                                doc.error_message = Some(format!(
                                    "report {} is already {}",
                                    report.id, report.status
                                ));
                                let doc = documents::update(tx, &doc)?;
                                warn!(
                                    report = %report.id,
                                    status = %report.status,
                                    "Extraction result not linked, report is closed"
                                );
                                return Ok(doc);
                            }
                        }
                    }
                    doc.carrier = extracted.carrier.clone().or(doc.carrier);
                    doc.invoice_number = extracted.invoice_number.clone();
                    doc.due_date = extracted.due_date;
                    doc.total_value = extracted.total_value;
                    doc.confidence_score = extracted.confidence_score.min(100);
                    doc.error_code = None;
                    doc.error_message = None;
                    doc.status = status;
                    let doc = documents::update(tx, &doc)?;
                    info!(
                        status = %doc.status,
                        confidence = doc.confidence_score,
                        total_value = ?doc.total_value,
                        "Extraction routed"
                    );
                    if doc.status == IntakeStatus::Success {
                        bridge::link_document(tx, &doc)?;
                    }
                    Ok(doc)
                }
            }
        })
    }

    fn fail_linked_report(&self, conn: &rusqlite::Connection, doc: &InvoiceDocument) -> Result<()> {
        if let Some(report) = reports::find_by_source(conn, doc.id)? {
            if let Some(failed) = governance::mark_failed(conn, report.id)? {
                warn!(report = %failed.id, "Linked report marked failed");
            }
        }
        Ok(())
    }

    /// Run extraction again for a failed document, or for an auto-accepted
    /// one whose report is still open.
    pub async fn reprocess(&self, id: Uuid) -> Result<ExtractionTask> {
        self.store.write(|tx| {
            let mut doc = documents::require(tx, id)?;
            match doc.status {
                IntakeStatus::Failed => {}
                IntakeStatus::Success => {
                    if let Some(report) = reports::find_by_source(tx, id)? {
                        if report.status.is_terminal() {
                            return Err(WorkflowError::validation(format!(
                                "report {} is already {}",
                                report.id, report.status
                            )));
                        }
                    }
                }
                other => {
                    return Err(WorkflowError::invalid_transition(
                        other,
                        IntakeStatus::Processing,
                    ));
                }
            }
            if doc.storage_handle.is_none() {
                return Err(WorkflowError::validation(
                    "stored file was purged; upload the document again",
                ));
            }
            doc.status = IntakeStatus::Processing;
            doc.error_code = None;
            doc.error_message = None;
            documents::update(tx, &doc)
        })?;
        info!(id = %id, "Reprocess requested");

        let pipeline = self.clone();
        let handle = tokio::spawn(async move { pipeline.extract_claimed(id).await });
        Ok(ExtractionTask {
            document_id: id,
            handle,
        })
    }

    /// Finalise a document with reviewed fields and create or update its
    /// report, atomically. `expected_revision` guards against confirming a
    /// snapshot that has since changed.
    pub fn confirm(
        &self,
        id: Uuid,
        fields: InvoiceFields,
        actor: &str,
        expected_revision: Option<i64>,
    ) -> Result<ConfirmOutcome> {
        let fields = validate_fields(fields)?;

        let outcome = self.store.write(|tx| {
            let mut doc = documents::require(tx, id)?;
            if let Some(revision) = expected_revision {
                if revision != doc.revision {
                    return Err(WorkflowError::conflict(format!(
                        "document {id} changed since it was opened for review"
                    )));
                }
            }
            if !doc.status.is_reviewable() {
                return Err(WorkflowError::invalid_transition(
                    doc.status,
                    IntakeStatus::Confirmed,
                ));
            }

            let review = if doc.fields() == fields {
                ReviewOutcome::Confirmed
            } else {
                ReviewOutcome::Corrected
            };
            let extraction_score = doc.confidence_score;
            doc.carrier = fields.carrier;
            doc.invoice_number = fields.invoice_number;
            doc.total_value = fields.total_value;
            doc.due_date = fields.due_date;
            doc.status = IntakeStatus::Confirmed;
            doc.error_code = None;
            doc.error_message = None;
            if review == ReviewOutcome::Corrected {
                doc.confidence_score = CORRECTED_CONFIDENCE;
            }
            let document = documents::update(tx, &doc)?;

            // a new report records what extraction scored, not the penalty
            let link = bridge::link_document(
                tx,
                &InvoiceDocument {
                    confidence_score: extraction_score,
                    ..document.clone()
                },
            )?;
            Ok(ConfirmOutcome {
                requires_attention: link.requires_attention(),
                document,
                report: link.report,
                created: link.created,
                review,
            })
        })?;

        info!(
            id = %id,
            actor,
            report = %outcome.report.id,
            review = ?outcome.review,
            requires_attention = outcome.requires_attention,
            "Document confirmed"
        );
        Ok(outcome)
    }

    /// Delete the stored file. The document and any report stay.
    pub async fn purge(&self, id: Uuid, confirmation: Confirmation) -> Result<InvoiceDocument> {
        confirmation.require("purging a stored document")?;

        let (doc, handle) = self.store.write(|tx| {
            let mut doc = documents::require(tx, id)?;
            if doc.status.is_in_flight() {
                return Err(WorkflowError::validation(
                    "cannot purge while extraction is running",
                ));
            }
            let Some(handle) = doc.storage_handle.take() else {
                return Ok((doc, None));
            };
            Ok((documents::update(tx, &doc)?, Some(handle)))
        })?;

        if let Some(handle) = handle {
            // the record no longer points at the blob; a failed delete only
            // leaves an orphan file behind
            if let Err(e) = self.storage.delete(&handle).await {
                warn!(id = %id, handle = %handle, error = %e, "Purged blob could not be deleted");
            }
            info!(id = %id, "Stored file purged");
        }
        Ok(doc)
    }

    /// The stored file of a document. Skipped duplicates point at the
    /// document that holds the file.
    pub async fn download(&self, id: Uuid) -> Result<StoredFile> {
        let doc = self.get(id)?;
        if let Some(original) = doc.duplicate_of {
            return Err(WorkflowError::validation(format!(
                "document {id} is a duplicate of {original}; download that one"
            )));
        }
        let Some(handle) = doc.storage_handle else {
            return Err(WorkflowError::Purged(id.to_string()));
        };
        let bytes = match self.storage.retrieve(&handle).await {
            Ok(bytes) => bytes,
            Err(StorageError::Missing(_)) => return Err(WorkflowError::Purged(id.to_string())),
            Err(e) => return Err(e.into()),
        };
        info!(id = %id, bytes = bytes.len(), "Stored file downloaded");
        Ok(StoredFile {
            filename: doc.filename,
            bytes,
        })
    }

    /// Fail documents stuck in flight for longer than the extraction timeout,
    /// e.g. after a crash. Returns how many were rescued.
    pub fn recover_stalled(&self) -> Result<usize> {
        let limit = self.config.extraction_timeout();
        let cutoff = now() - limit;
        let message = format!("extraction did not finish within {} ms", limit.as_millis());

        let rescued = self.store.write(|tx| {
            let mut rescued = 0;
            for mut doc in documents::list_stalled(tx, cutoff)? {
                doc.status = IntakeStatus::Failed;
                doc.error_code = Some(EXTRACTION_TIMEOUT.to_string());
                doc.error_message = Some(message.clone());
                let doc = documents::update(tx, &doc)?;
                self.fail_linked_report(tx, &doc)?;
                warn!(id = %doc.id, "Stalled extraction marked failed");
                rescued += 1;
            }
            Ok(rescued)
        })?;
        Ok(rescued)
    }

    /// Documents for the review queue: everything unsettled plus terminal
    /// ones updated since `recent_since`.
    pub fn list_inbox(&self, recent_since: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
        if let Err(e) = self.recover_stalled() {
            warn!(error = %e, "Stalled-job rescue failed");
        }
        self.store
            .read(|conn| documents::list_inbox(conn, recent_since))
    }

    pub fn get(&self, id: Uuid) -> Result<InvoiceDocument> {
        self.store.read(|conn| documents::require(conn, id))
    }

    pub fn intake_summary(&self) -> Result<Vec<(IntakeStatus, usize)>> {
        self.store.read(documents::count_by_status)
    }
}

#[async_trait]
impl IntakeQueue for IntakePipeline {
    async fn fetch_inbox(&self, recent_since: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
        self.list_inbox(recent_since)
    }

    async fn load(&self, id: Uuid) -> Result<Option<InvoiceDocument>> {
        self.store.read(|conn| documents::get(conn, id))
    }

    async fn confirm(
        &self,
        id: Uuid,
        fields: InvoiceFields,
        actor: &str,
        expected_revision: Option<i64>,
    ) -> Result<ConfirmOutcome> {
        IntakePipeline::confirm(self, id, fields, actor, expected_revision)
    }

    fn review_threshold(&self) -> u8 {
        self.config.review_threshold
    }
}
