//! Extraction collaborators: turn uploaded bytes into a best-effort invoice
//! record with a confidence score.

pub mod heuristics;
pub mod llm;
pub mod pdf;

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

pub use heuristics::HeuristicExtractor;
pub use llm::RemoteExtractor;

pub const EXTRACTION_TIMEOUT: &str = "EXTRACTION_TIMEOUT";
pub const CORRUPT_FILE: &str = "CORRUPT_FILE";
pub const UNSUPPORTED_LAYOUT: &str = "UNSUPPORTED_LAYOUT";
pub const SERVICE_ERROR: &str = "EXTRACTION_SERVICE_ERROR";
pub const STORAGE_UNAVAILABLE: &str = "STORAGE_UNAVAILABLE";
/// Extraction succeeded but the linked report was closed meanwhile.
pub const REPORT_LOCKED: &str = "REPORT_LOCKED";

/// Structured result of one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    pub carrier: Option<String>,
    pub invoice_number: Option<String>,
    pub due_date: Option<Date>,
    pub total_value: Option<Decimal>,
    /// 0..=100
    pub confidence_score: u8,
}

impl ExtractedInvoice {
    /// How many of the four fields were found.
    pub fn coverage(&self) -> (usize, usize) {
        let filled = [
            self.carrier.is_some(),
            self.invoice_number.is_some(),
            self.due_date.is_some(),
            self.total_value.is_some(),
        ]
        .iter()
        .filter(|&&v| v)
        .count();
        (filled, 4)
    }
}

/// Hard failure reported by an extractor. Recorded on the document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ExtractionFailure {
    pub code: &'static str,
    pub message: String,
}

impl ExtractionFailure {
    pub fn new(code: &'static str, message: impl fmt::Display) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            EXTRACTION_TIMEOUT,
            format!("extraction exceeded {} ms", limit.as_millis()),
        )
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedInvoice, ExtractionFailure>;
}
