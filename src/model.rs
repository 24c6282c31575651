//! Domain records shared by the intake pipeline, the review reconciler and
//! the report workflow.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Actor recorded for transitions performed by the pipeline itself.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Visual emphasis for a status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Neutral,
    Info,
    Success,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusBadge {
    pub label: &'static str,
    pub tone: Tone,
}

const fn badge(label: &'static str, tone: Tone) -> StatusBadge {
    StatusBadge { label, tone }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Lifecycle of one uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeStatus {
    Inbox,
    Processing,
    OcrRunning,
    PendingReview,
    Success,
    Failed,
    Skipped,
    Confirmed,
}

impl IntakeStatus {
    pub const ALL: [IntakeStatus; 8] = [
        IntakeStatus::Inbox,
        IntakeStatus::Processing,
        IntakeStatus::OcrRunning,
        IntakeStatus::PendingReview,
        IntakeStatus::Success,
        IntakeStatus::Failed,
        IntakeStatus::Skipped,
        IntakeStatus::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeStatus::Inbox => "INBOX",
            IntakeStatus::Processing => "PROCESSING",
            IntakeStatus::OcrRunning => "OCR_RUNNING",
            IntakeStatus::PendingReview => "PENDING_REVIEW",
            IntakeStatus::Success => "SUCCESS",
            IntakeStatus::Failed => "FAILED",
            IntakeStatus::Skipped => "SKIPPED",
            IntakeStatus::Confirmed => "CONFIRMED",
        }
    }

    /// Extraction is running for the document.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, IntakeStatus::Processing | IntakeStatus::OcrRunning)
    }

    /// No further automated transition will happen. `Failed` only leaves
    /// through an explicit reprocess.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntakeStatus::Success
                | IntakeStatus::Failed
                | IntakeStatus::Skipped
                | IntakeStatus::Confirmed
        )
    }

    /// States a human may open a review session on.
    pub fn is_reviewable(&self) -> bool {
        matches!(
            self,
            IntakeStatus::PendingReview | IntakeStatus::Success | IntakeStatus::Confirmed
        )
    }

    pub fn badge(&self) -> StatusBadge {
        match self {
            IntakeStatus::Inbox => badge("Inbox", Tone::Neutral),
            IntakeStatus::Processing => badge("Processing", Tone::Info),
            IntakeStatus::OcrRunning => badge("Reading document", Tone::Info),
            IntakeStatus::PendingReview => badge("Awaiting review", Tone::Warning),
            IntakeStatus::Success => badge("Imported", Tone::Success),
            IntakeStatus::Failed => badge("Failed", Tone::Danger),
            IntakeStatus::Skipped => badge("Already imported", Tone::Neutral),
            IntakeStatus::Confirmed => badge("Confirmed", Tone::Success),
        }
    }
}

impl fmt::Display for IntakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntakeStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntakeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "intake status",
                value: s.to_string(),
            })
    }
}

/// An uploaded carrier invoice and everything extracted or corrected on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub id: Uuid,
    pub fingerprint: String,
    pub filename: String,
    /// `None` once the stored file has been purged, and for skipped uploads.
    pub storage_handle: Option<String>,
    pub carrier: Option<String>,
    pub invoice_number: Option<String>,
    pub due_date: Option<Date>,
    pub total_value: Option<Decimal>,
    pub confidence_score: u8,
    pub status: IntakeStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Set on skipped uploads: the document that owns the fingerprint.
    pub duplicate_of: Option<Uuid>,
    /// Bumped on every write; review sessions hold the revision they opened.
    pub revision: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl InvoiceDocument {
    pub fn fields(&self) -> InvoiceFields {
        InvoiceFields {
            carrier: self.carrier.clone(),
            invoice_number: self.invoice_number.clone(),
            total_value: self.total_value,
            due_date: self.due_date,
        }
    }
}

/// The human-editable part of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub carrier: Option<String>,
    pub invoice_number: Option<String>,
    pub total_value: Option<Decimal>,
    pub due_date: Option<Date>,
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Review,
    Approved,
    Canceled,
    Failed,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 5] = [
        ReportStatus::Pending,
        ReportStatus::Review,
        ReportStatus::Approved,
        ReportStatus::Canceled,
        ReportStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "PENDING",
            ReportStatus::Review => "REVIEW",
            ReportStatus::Approved => "APPROVED",
            ReportStatus::Canceled => "CANCELED",
            ReportStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Approved | ReportStatus::Canceled)
    }

    pub fn badge(&self) -> StatusBadge {
        match self {
            ReportStatus::Pending => badge("Pending", Tone::Neutral),
            ReportStatus::Review => badge("In review", Tone::Warning),
            ReportStatus::Approved => badge("Approved", Tone::Success),
            ReportStatus::Canceled => badge("Canceled", Tone::Danger),
            ReportStatus::Failed => badge("Failed", Tone::Danger),
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "report status",
                value: s.to_string(),
            })
    }
}

/// Action label stored on each history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportAction {
    SubmitForReview,
    Approve,
    Cancel,
    Resubmit,
    /// System-only: the source document failed a reprocess.
    MarkFailed,
}

impl ReportAction {
    pub const ALL: [ReportAction; 5] = [
        ReportAction::SubmitForReview,
        ReportAction::Approve,
        ReportAction::Cancel,
        ReportAction::Resubmit,
        ReportAction::MarkFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportAction::SubmitForReview => "SUBMIT_FOR_REVIEW",
            ReportAction::Approve => "APPROVE",
            ReportAction::Cancel => "CANCEL",
            ReportAction::Resubmit => "RESUBMIT",
            ReportAction::MarkFailed => "MARK_FAILED",
        }
    }

    /// Rejections must carry a justification; nothing else records one.
    pub fn requires_comment(&self) -> bool {
        matches!(self, ReportAction::Cancel)
    }
}

impl FromStr for ReportAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "report action",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub title: String,
    pub reference_date: Date,
    pub due_date: Option<Date>,
    pub category_id: Uuid,
    pub total_value: Decimal,
    pub status: ReportStatus,
    /// Weak back-reference to the document this report was generated from.
    pub invoice_source_id: Option<Uuid>,
    /// Copied from the source document at creation and never updated.
    pub confidence_score: Option<u8>,
    /// Zero-value reports produced from a confirmation.
    pub requires_attention: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHistoryEntry {
    pub id: i64,
    pub report_id: Uuid,
    pub action: ReportAction,
    pub from_status: ReportStatus,
    pub to_status: ReportStatus,
    pub actor: String,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

/// Display bucket for a report's frozen confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Verified,
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn badge(&self) -> StatusBadge {
        match self {
            ConfidenceBand::Verified => badge("Verified", Tone::Success),
            ConfidenceBand::High => badge("High confidence", Tone::Info),
            ConfidenceBand::Medium => badge("Medium confidence", Tone::Warning),
            ConfidenceBand::Low => badge("Low confidence", Tone::Danger),
        }
    }
}

/// Explicit acknowledgement required by destructive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    Unconfirmed,
    Confirmed,
}

impl Confirmation {
    pub(crate) fn require(self, what: &str) -> crate::error::Result<()> {
        match self {
            Confirmation::Confirmed => Ok(()),
            Confirmation::Unconfirmed => Err(crate::error::WorkflowError::validation(format!(
                "{what} requires explicit confirmation"
            ))),
        }
    }
}
