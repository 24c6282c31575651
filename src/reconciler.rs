//! Client-side review queue: periodic refresh of intake state, merged
//! without clobbering open review sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::error::{Result, WorkflowError};
use crate::intake::ConfirmOutcome;
use crate::model::{IntakeStatus, InvoiceDocument, InvoiceFields};
use crate::store::now;

/// What the reconciler needs from the intake side.
#[async_trait]
pub trait IntakeQueue: Send + Sync {
    async fn fetch_inbox(&self, recent_since: OffsetDateTime) -> Result<Vec<InvoiceDocument>>;
    async fn load(&self, id: Uuid) -> Result<Option<InvoiceDocument>>;
    async fn confirm(
        &self,
        id: Uuid,
        fields: InvoiceFields,
        actor: &str,
        expected_revision: Option<i64>,
    ) -> Result<ConfirmOutcome>;
    /// Scores below this get a low-confidence warning.
    fn review_threshold(&self) -> u8;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewWarning {
    LowConfidence { score: u8 },
    MissingTotal,
    ZeroTotal,
    MissingDueDate,
    ExtractionFailed { code: String },
    AlreadyImported { existing: Option<Uuid> },
}

pub fn warnings_for(doc: &InvoiceDocument, review_threshold: u8) -> Vec<ReviewWarning> {
    let mut warnings = Vec::new();
    match doc.status {
        IntakeStatus::Failed => warnings.push(ReviewWarning::ExtractionFailed {
            code: doc.error_code.clone().unwrap_or_default(),
        }),
        IntakeStatus::Skipped => warnings.push(ReviewWarning::AlreadyImported {
            existing: doc.duplicate_of,
        }),
        status if status.is_reviewable() => {
            if status == IntakeStatus::PendingReview && doc.confidence_score < review_threshold {
                warnings.push(ReviewWarning::LowConfidence {
                    score: doc.confidence_score,
                });
            }
            match doc.total_value {
                None => warnings.push(ReviewWarning::MissingTotal),
                Some(v) if v == Decimal::ZERO => warnings.push(ReviewWarning::ZeroTotal),
                Some(_) => {}
            }
            if doc.due_date.is_none() {
                warnings.push(ReviewWarning::MissingDueDate);
            }
        }
        _ => {}
    }
    warnings
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxItem {
    pub document: InvoiceDocument,
    pub warnings: Vec<ReviewWarning>,
}

/// Why an open review can no longer be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// The document was written after the session opened.
    Changed,
    /// The stored file was purged.
    Purged,
    /// The document no longer exists.
    Removed,
}

/// A human's in-progress edit of one document.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewSession {
    pub document_id: Uuid,
    pub opened_revision: i64,
    pub draft: InvoiceFields,
    pub stale: Option<StaleReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Refreshed { documents: usize },
    /// A previous poll was still running.
    Skipped,
    /// Logged and swallowed; the previous view is kept.
    Failed,
}

#[derive(Default)]
struct ViewState {
    items: Vec<InboxItem>,
    sessions: HashMap<Uuid, ReviewSession>,
    last_refresh: Option<OffsetDateTime>,
}

/// Clears the busy flag when a poll ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ReviewReconciler {
    queue: Arc<dyn IntakeQueue>,
    config: ReconcilerConfig,
    state: Mutex<ViewState>,
    busy: AtomicBool,
}

impl ReviewReconciler {
    pub fn new(queue: Arc<dyn IntakeQueue>, config: ReconcilerConfig) -> Self {
        Self {
            queue,
            config,
            state: Mutex::new(ViewState::default()),
            busy: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One refresh. Never overlaps with another; failures are logged only.
    pub async fn poll(&self) -> PollOutcome {
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!("Poll still running, tick skipped");
            return PollOutcome::Skipped;
        }
        let _busy = BusyGuard(&self.busy);

        let recent_since = now() - self.config.recent_window();
        let documents = match self.fetch_with_retry(recent_since).await {
            Ok(documents) => documents,
            Err(e) => {
                warn!(error = %e, "Inbox refresh failed");
                return PollOutcome::Failed;
            }
        };

        let count = documents.len();
        self.merge(documents).await;
        debug!(documents = count, "Inbox refreshed");
        PollOutcome::Refreshed { documents: count }
    }

    /// Reads are safe to repeat, so transient failures get a bounded number
    /// of retries.
    async fn fetch_with_retry(&self, recent_since: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
        let mut attempt = 0;
        loop {
            match self.queue.fetch_inbox(recent_since).await {
                Ok(documents) => return Ok(documents),
                Err(e) if e.is_transient() && attempt < self.config.read_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Retrying inbox read");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn merge(&self, documents: Vec<InvoiceDocument>) {
        let threshold = self.queue.review_threshold();
        let open: Vec<(Uuid, i64)> = {
            let state = self.lock();
            state
                .sessions
                .values()
                .filter(|s| s.stale.is_none())
                .map(|s| (s.document_id, s.opened_revision))
                .collect()
        };

        // sessions whose document dropped out of the window are looked up
        // individually
        let mut verdicts = Vec::new();
        for (id, revision) in open {
            let current = match documents.iter().find(|d| d.id == id) {
                Some(doc) => Some(doc.clone()),
                None => match self.queue.load(id).await {
                    Ok(doc) => doc,
                    Err(e) => {
                        warn!(id = %id, error = %e, "Could not check open review");
                        continue;
                    }
                },
            };
            let verdict = match current {
                None => Some(StaleReason::Removed),
                Some(doc) if doc.revision != revision && doc.storage_handle.is_none() => {
                    Some(StaleReason::Purged)
                }
                Some(doc) if doc.revision != revision => Some(StaleReason::Changed),
                Some(_) => None,
            };
            if let Some(reason) = verdict {
                verdicts.push((id, reason));
            }
        }

        let mut state = self.lock();
        for (id, reason) in verdicts {
            if let Some(session) = state.sessions.get_mut(&id) {
                if session.stale.is_none() {
                    info!(id = %id, reason = ?reason, "Open review went stale");
                    session.stale = Some(reason);
                }
            }
        }
        state.items = documents
            .into_iter()
            .map(|document| InboxItem {
                warnings: warnings_for(&document, threshold),
                document,
            })
            .collect();
        state.last_refresh = Some(now());
    }

    pub fn inbox(&self) -> Vec<InboxItem> {
        self.lock().items.clone()
    }

    pub fn last_refresh(&self) -> Option<OffsetDateTime> {
        self.lock().last_refresh
    }

    pub fn session(&self, id: Uuid) -> Option<ReviewSession> {
        self.lock().sessions.get(&id).cloned()
    }

    /// Start (or restart) reviewing a document from its current state.
    pub async fn open_review(&self, id: Uuid) -> Result<ReviewSession> {
        let doc = self
            .queue
            .load(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("invoice document", id))?;
        if !doc.status.is_reviewable() {
            return Err(WorkflowError::validation(format!(
                "document {id} is {} and cannot be reviewed",
                doc.status
            )));
        }

        let session = ReviewSession {
            document_id: id,
            opened_revision: doc.revision,
            draft: doc.fields(),
            stale: None,
        };
        self.lock().sessions.insert(id, session.clone());
        info!(id = %id, revision = doc.revision, "Review opened");
        Ok(session)
    }

    pub fn edit_review(&self, id: Uuid, draft: InvoiceFields) -> Result<ReviewSession> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::not_found("review session", id))?;
        if let Some(reason) = session.stale {
            return Err(stale_conflict(id, reason));
        }
        session.draft = draft;
        Ok(session.clone())
    }

    /// Discard the session. Nothing is written.
    pub fn close_review(&self, id: Uuid) -> bool {
        self.lock().sessions.remove(&id).is_some()
    }

    /// Confirm the session's draft against the revision it was opened on.
    pub async fn submit_review(&self, id: Uuid, actor: &str) -> Result<ConfirmOutcome> {
        let session = self
            .session(id)
            .ok_or_else(|| WorkflowError::not_found("review session", id))?;
        if let Some(reason) = session.stale {
            return Err(stale_conflict(id, reason));
        }

        match self
            .queue
            .confirm(id, session.draft, actor, Some(session.opened_revision))
            .await
        {
            Ok(outcome) => {
                self.lock().sessions.remove(&id);
                Ok(outcome)
            }
            Err(e) => {
                if e.is_conflict() {
                    if let Some(session) = self.lock().sessions.get_mut(&id) {
                        session.stale = Some(StaleReason::Changed);
                    }
                }
                Err(e)
            }
        }
    }

    /// Poll on a fixed interval until `shutdown` flips to true. Missed ticks
    /// are dropped, not queued.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.config.poll_interval_ms, "Review poller started");
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Review poller stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        let (stop, shutdown) = watch::channel(false);
        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move { reconciler.run(shutdown).await });
        PollerHandle { stop, handle }
    }
}

fn stale_conflict(id: Uuid, reason: StaleReason) -> WorkflowError {
    WorkflowError::conflict(format!(
        "document {id} changed while under review ({reason:?}); reopen it"
    ))
}

pub struct PollerHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Review poller ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::intake::{SubmitOutcome, Upload};
    use crate::testing::{ScriptedExtractor, dec, extracted, new_document, pipeline};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Queue over a plain map, with injectable read failures and latency.
    #[derive(Default)]
    struct FakeQueue {
        docs: Mutex<HashMap<Uuid, InvoiceDocument>>,
        failures_left: AtomicUsize,
        fetches: AtomicUsize,
        confirms: AtomicUsize,
        delay_ms: u64,
    }

    impl FakeQueue {
        fn put(&self, doc: InvoiceDocument) {
            self.docs.lock().unwrap().insert(doc.id, doc);
        }

        fn edit(&self, id: Uuid, f: impl FnOnce(&mut InvoiceDocument)) {
            let mut docs = self.docs.lock().unwrap();
            let doc = docs.get_mut(&id).unwrap();
            f(doc);
            doc.revision += 1;
        }
    }

    #[async_trait]
    impl IntakeQueue for FakeQueue {
        async fn fetch_inbox(&self, _since: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(WorkflowError::TransientIo("connection reset".into()));
            }
            Ok(self.docs.lock().unwrap().values().cloned().collect())
        }

        async fn load(&self, id: Uuid) -> Result<Option<InvoiceDocument>> {
            Ok(self.docs.lock().unwrap().get(&id).cloned())
        }

        async fn confirm(
            &self,
            _id: Uuid,
            _fields: InvoiceFields,
            _actor: &str,
            _expected_revision: Option<i64>,
        ) -> Result<ConfirmOutcome> {
            self.confirms.fetch_add(1, Ordering::SeqCst);
            Err(WorkflowError::conflict("fake queue does not confirm"))
        }

        fn review_threshold(&self) -> u8 {
            50
        }
    }

    fn quick_config() -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval_ms: 10,
            read_retries: 3,
            retry_backoff_ms: 1,
            recent_window_secs: 3600,
        }
    }

    fn reviewable(score: u8) -> InvoiceDocument {
        let mut doc = new_document("r.pdf", &format!("fp-review-{score}"));
        doc.status = IntakeStatus::PendingReview;
        doc.confidence_score = score;
        doc.carrier = Some("VIVO".into());
        doc.total_value = Some(dec("42.00"));
        doc
    }

    fn setup(queue: FakeQueue) -> (Arc<FakeQueue>, ReviewReconciler) {
        let queue = Arc::new(queue);
        let reconciler = ReviewReconciler::new(queue.clone(), quick_config());
        (queue, reconciler)
    }

    #[test]
    fn warnings_follow_document_state() {
        let low = reviewable(35);
        assert_eq!(
            warnings_for(&low, 50),
            vec![
                ReviewWarning::LowConfidence { score: 35 },
                ReviewWarning::MissingDueDate
            ]
        );

        let mut zero = reviewable(70);
        zero.total_value = Some(Decimal::ZERO);
        assert!(warnings_for(&zero, 50).contains(&ReviewWarning::ZeroTotal));

        let mut failed = new_document("f.pdf", "fp-f");
        failed.status = IntakeStatus::Failed;
        failed.error_code = Some("CORRUPT_FILE".into());
        assert_eq!(
            warnings_for(&failed, 50),
            vec![ReviewWarning::ExtractionFailed {
                code: "CORRUPT_FILE".into()
            }]
        );

        assert!(warnings_for(&new_document("i.pdf", "fp-i"), 50).is_empty());
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried() {
        let (queue, reconciler) = setup(FakeQueue::default());
        queue.put(reviewable(35));
        queue.failures_left.store(2, Ordering::SeqCst);

        assert_eq!(
            reconciler.poll().await,
            PollOutcome::Refreshed { documents: 1 }
        );
        assert_eq!(queue.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(reconciler.inbox().len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_is_swallowed_and_keeps_the_view() {
        let (queue, reconciler) = setup(FakeQueue::default());
        queue.put(reviewable(60));
        reconciler.poll().await;
        assert!(reconciler.last_refresh().is_some());

        queue.failures_left.store(100, Ordering::SeqCst);
        assert_eq!(reconciler.poll().await, PollOutcome::Failed);
        assert_eq!(reconciler.inbox().len(), 1);
        // one earlier fetch, then the first attempt plus three retries
        assert_eq!(queue.fetches.load(Ordering::SeqCst), 1 + 1 + 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_polls_are_skipped() {
        let (queue, reconciler) = setup(FakeQueue {
            delay_ms: 100,
            ..Default::default()
        });
        let reconciler = Arc::new(reconciler);

        let first = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.poll().await, PollOutcome::Skipped);

        assert!(matches!(first.await.unwrap(), PollOutcome::Refreshed { .. }));
        assert_eq!(queue.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_change_marks_session_stale_without_touching_draft() {
        let (queue, reconciler) = setup(FakeQueue::default());
        let doc = reviewable(60);
        queue.put(doc.clone());

        reconciler.open_review(doc.id).await.unwrap();
        let mut draft = doc.fields();
        draft.total_value = Some(dec("43.00"));
        reconciler.edit_review(doc.id, draft.clone()).unwrap();

        queue.edit(doc.id, |d| d.total_value = Some(dec("99.00")));
        reconciler.poll().await;

        let session = reconciler.session(doc.id).unwrap();
        assert_eq!(session.stale, Some(StaleReason::Changed));
        assert_eq!(session.draft, draft);

        assert!(reconciler.edit_review(doc.id, draft).unwrap_err().is_conflict());
        assert!(
            reconciler
                .submit_review(doc.id, "ana")
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert_eq!(queue.confirms.load(Ordering::SeqCst), 0);

        // reopening picks up the new state
        let reopened = reconciler.open_review(doc.id).await.unwrap();
        assert!(reopened.stale.is_none());
        assert_eq!(reopened.draft.total_value, Some(dec("99.00")));
    }

    #[tokio::test]
    async fn purge_and_removal_are_distinguished() {
        let (queue, reconciler) = setup(FakeQueue::default());
        let purged = reviewable(60);
        let mut removed = reviewable(61);
        removed.fingerprint = "fp-removed".into();
        queue.put(purged.clone());
        queue.put(removed.clone());

        reconciler.open_review(purged.id).await.unwrap();
        reconciler.open_review(removed.id).await.unwrap();

        queue.edit(purged.id, |d| d.storage_handle = None);
        queue.docs.lock().unwrap().remove(&removed.id);
        reconciler.poll().await;

        assert_eq!(
            reconciler.session(purged.id).unwrap().stale,
            Some(StaleReason::Purged)
        );
        assert_eq!(
            reconciler.session(removed.id).unwrap().stale,
            Some(StaleReason::Removed)
        );
    }

    #[tokio::test]
    async fn closing_a_review_writes_nothing() {
        let (queue, reconciler) = setup(FakeQueue::default());
        let doc = reviewable(60);
        queue.put(doc.clone());

        reconciler.open_review(doc.id).await.unwrap();
        assert!(reconciler.close_review(doc.id));
        assert!(reconciler.session(doc.id).is_none());
        assert_eq!(queue.confirms.load(Ordering::SeqCst), 0);
        assert_eq!(queue.load(doc.id).await.unwrap().unwrap().revision, doc.revision);
    }

    #[tokio::test]
    async fn unreviewable_documents_cannot_be_opened() {
        let (queue, reconciler) = setup(FakeQueue::default());
        let doc = new_document("inbox.pdf", "fp-inbox");
        queue.put(doc.clone());
        assert!(reconciler.open_review(doc.id).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn submitted_review_confirms_through_the_pipeline() {
        let extractor = ScriptedExtractor::returning(extracted(35, Some("120.00")));
        let (_, pipeline) = pipeline(extractor, IntakeConfig::default());
        let SubmitOutcome::Accepted { extraction, .. } = pipeline
            .submit(Upload::new("b.pdf", b"bytes Y".to_vec()))
            .await
            .unwrap()
        else {
            panic!("expected a fresh upload");
        };
        let doc = extraction.wait().await.unwrap();

        let reconciler = ReviewReconciler::new(Arc::new(pipeline), quick_config());
        reconciler.poll().await;
        let item = reconciler
            .inbox()
            .into_iter()
            .find(|i| i.document.id == doc.id)
            .unwrap();
        assert!(item.warnings.contains(&ReviewWarning::LowConfidence { score: 35 }));

        reconciler.open_review(doc.id).await.unwrap();
        let outcome = reconciler.submit_review(doc.id, "ana").await.unwrap();
        assert_eq!(outcome.document.status, IntakeStatus::Confirmed);
        assert!(outcome.created);
        assert!(reconciler.session(doc.id).is_none());
    }

    #[tokio::test]
    async fn poller_runs_until_stopped() {
        let (queue, reconciler) = setup(FakeQueue::default());
        let handle = Arc::new(reconciler).spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        let after_stop = queue.fetches.load(Ordering::SeqCst);
        assert!(after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(queue.fetches.load(Ordering::SeqCst), after_stop);
    }
}
