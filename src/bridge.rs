//! Links a confirmed or auto-accepted document to its report.

use rusqlite::Connection;
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::model::{IntakeStatus, InvoiceDocument, Report, ReportStatus};
use crate::store::{categories, now, reports};

const UNKNOWN_CARRIER: &str = "Other";

#[derive(Debug, Clone)]
pub struct LinkOutcome {
    pub report: Report,
    /// False when an existing report was updated in place.
    pub created: bool,
}

impl LinkOutcome {
    /// Zero-value reports are accepted but need a human look.
    pub fn requires_attention(&self) -> bool {
        self.report.requires_attention
    }
}

/// `VIVO` -> `Vivo`
fn category_name(carrier: Option<&str>) -> String {
    let carrier = carrier.map(str::trim).unwrap_or_default();
    let mut chars = carrier.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => UNKNOWN_CARRIER.to_string(),
    }
}

fn report_title(carrier: Option<&str>, reference: Date) -> String {
    let carrier = carrier
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| UNKNOWN_CARRIER.to_uppercase());
    format!("INVOICE {carrier} - {}/{}", reference.month(), reference.year())
}

/// Create the report for `doc`, or update the one already linked to it.
/// Must run inside the same write transaction as the document update so
/// that two confirmations of one document produce one report.
pub fn link_document(conn: &Connection, doc: &InvoiceDocument) -> Result<LinkOutcome> {
    if !matches!(doc.status, IntakeStatus::Success | IntakeStatus::Confirmed) {
        return Err(WorkflowError::validation(format!(
            "document {} is {} and cannot produce a report",
            doc.id, doc.status
        )));
    }
    let total_value = doc
        .total_value
        .ok_or_else(|| WorkflowError::validation("total value is required"))?;
    if total_value < Decimal::ZERO {
        return Err(WorkflowError::validation("total value cannot be negative"));
    }

    let carrier = doc.carrier.as_deref();
    let category = categories::get_or_create(conn, &category_name(carrier))?;
    let reference_date = doc
        .due_date
        .unwrap_or_else(|| OffsetDateTime::now_utc().date());
    let title = report_title(carrier, reference_date);
    let requires_attention = total_value.is_zero();

    if let Some(mut report) = reports::find_by_source(conn, doc.id)? {
        if report.status.is_terminal() {
            return Err(WorkflowError::conflict(format!(
                "report {} for document {} is already {}",
                report.id, doc.id, report.status
            )));
        }
        report.title = title;
        report.reference_date = reference_date;
        report.due_date = doc.due_date;
        report.category_id = category.id;
        report.total_value = total_value;
        report.requires_attention = requires_attention;
        let report = reports::update_fields(conn, &report)?;
        info!(report = %report.id, document = %doc.id, "Linked report updated");
        return Ok(LinkOutcome {
            report,
            created: false,
        });
    }

    let created_at = now();
    let report = Report {
        id: Uuid::new_v4(),
        title,
        reference_date,
        due_date: doc.due_date,
        category_id: category.id,
        total_value,
        status: ReportStatus::Pending,
        invoice_source_id: Some(doc.id),
        confidence_score: Some(doc.confidence_score),
        requires_attention,
        created_at,
        updated_at: created_at,
    };
    reports::insert(conn, &report)?;
    info!(
        report = %report.id,
        document = %doc.id,
        confidence = doc.confidence_score,
        requires_attention,
        "Report created from document"
    );
    Ok(LinkOutcome {
        report,
        created: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::documents;
    use crate::testing::{dec, new_document};
    use time::macros::date;

    fn accepted(store: &Store, score: u8, total: &str) -> InvoiceDocument {
        let mut doc = new_document("vivo.pdf", &format!("fp-{score}-{total}"));
        doc.status = IntakeStatus::Success;
        doc.carrier = Some("VIVO".into());
        doc.due_date = Some(date!(2026 - 01 - 10));
        doc.total_value = Some(dec(total));
        doc.confidence_score = score;
        store.write(|tx| documents::claim(tx, doc.clone())).unwrap();
        doc
    }

    #[test]
    fn names_and_titles() {
        assert_eq!(category_name(Some("VIVO")), "Vivo");
        assert_eq!(category_name(Some("  ")), "Other");
        assert_eq!(category_name(None), "Other");
        assert_eq!(
            report_title(Some("claro"), date!(2026 - 02 - 15)),
            "INVOICE CLARO - February/2026"
        );
    }

    #[test]
    fn linking_twice_updates_the_same_report() {
        let store = Store::open_in_memory().unwrap();
        let mut doc = accepted(&store, 92, "189.90");

        let first = store.write(|tx| link_document(tx, &doc)).unwrap();
        assert!(first.created);
        assert_eq!(first.report.status, ReportStatus::Pending);
        assert_eq!(first.report.confidence_score, Some(92));
        assert_eq!(first.report.invoice_source_id, Some(doc.id));

        doc.total_value = Some(dec("200.00"));
        doc.confidence_score = 40;
        let second = store.write(|tx| link_document(tx, &doc)).unwrap();
        assert!(!second.created);
        assert_eq!(second.report.id, first.report.id);
        assert_eq!(second.report.total_value, dec("200.00"));
        // frozen at creation
        assert_eq!(second.report.confidence_score, Some(92));

        let all = store
            .read(|conn| reports::list(conn, &Default::default()))
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn zero_total_is_flagged() {
        let store = Store::open_in_memory().unwrap();
        let doc = accepted(&store, 35, "0.00");
        let outcome = store.write(|tx| link_document(tx, &doc)).unwrap();
        assert!(outcome.requires_attention());
    }

    #[test]
    fn terminal_report_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let doc = accepted(&store, 92, "10.00");
        let linked = store.write(|tx| link_document(tx, &doc)).unwrap();
        store
            .write(|tx| {
                reports::set_status(tx, linked.report.id, ReportStatus::Pending, ReportStatus::Canceled)
            })
            .unwrap();

        let err = store.write(|tx| link_document(tx, &doc)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn documents_under_review_are_refused() {
        let store = Store::open_in_memory().unwrap();
        let mut doc = accepted(&store, 60, "10.00");
        doc.status = IntakeStatus::PendingReview;
        assert!(store.write(|tx| link_document(tx, &doc)).unwrap_err().is_validation());
    }
}
