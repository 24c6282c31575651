use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{date_opt_col, format_date, now, parsed, parsed_opt, timestamp_col, to_millis};
use crate::error::{Result, WorkflowError};
use crate::model::{IntakeStatus, InvoiceDocument};

const COLUMNS: &str = "id, fingerprint, filename, storage_handle, carrier, invoice_number, due_date,
     total_value, confidence_score, status, error_code, error_message, duplicate_of, revision,
     created_at, updated_at";

/// Result of registering an upload against the fingerprint index.
#[derive(Debug)]
pub enum Claim {
    Fresh(InvoiceDocument),
    Duplicate {
        document: InvoiceDocument,
        existing: Uuid,
    },
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<InvoiceDocument> {
    Ok(InvoiceDocument {
        id: parsed(row, 0)?,
        fingerprint: row.get(1)?,
        filename: row.get(2)?,
        storage_handle: row.get(3)?,
        carrier: row.get(4)?,
        invoice_number: row.get(5)?,
        due_date: date_opt_col(row, 6)?,
        total_value: parsed_opt(row, 7)?,
        confidence_score: row.get(8)?,
        status: parsed(row, 9)?,
        error_code: row.get(10)?,
        error_message: row.get(11)?,
        duplicate_of: parsed_opt(row, 12)?,
        revision: row.get(13)?,
        created_at: timestamp_col(row, 14)?,
        updated_at: timestamp_col(row, 15)?,
    })
}

fn insert(conn: &Connection, doc: &InvoiceDocument) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO invoice_documents ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            doc.id.to_string(),
            doc.fingerprint,
            doc.filename,
            doc.storage_handle,
            doc.carrier,
            doc.invoice_number,
            doc.due_date.map(format_date),
            doc.total_value.map(|v| v.to_string()),
            doc.confidence_score,
            doc.status.as_str(),
            doc.error_code,
            doc.error_message,
            doc.duplicate_of.map(|id| id.to_string()),
            doc.revision,
            to_millis(doc.created_at),
            to_millis(doc.updated_at),
        ],
    )?;
    Ok(())
}

/// Insert an upload, marking it skipped when another live document already
/// owns the fingerprint. Must run inside a write transaction.
pub fn claim(conn: &Connection, mut doc: InvoiceDocument) -> Result<Claim> {
    if let Some(existing) = find_active_by_fingerprint(conn, &doc.fingerprint)? {
        doc.status = IntakeStatus::Skipped;
        doc.storage_handle = None;
        doc.duplicate_of = Some(existing.id);
        insert(conn, &doc)?;
        info!(id = %doc.id, duplicate_of = %existing.id, "Upload skipped: already imported");
        return Ok(Claim::Duplicate {
            document: doc,
            existing: existing.id,
        });
    }

    insert(conn, &doc)?;
    info!(id = %doc.id, filename = %doc.filename, "Document registered");
    Ok(Claim::Fresh(doc))
}

pub fn find_active_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<InvoiceDocument>> {
    let doc = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM invoice_documents
                 WHERE fingerprint = ?1 AND status <> 'SKIPPED'"
            ),
            params![fingerprint],
            row_to_document,
        )
        .optional()?;
    Ok(doc)
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<InvoiceDocument>> {
    let doc = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM invoice_documents WHERE id = ?1"),
            params![id.to_string()],
            row_to_document,
        )
        .optional()?;
    Ok(doc)
}

pub fn require(conn: &Connection, id: Uuid) -> Result<InvoiceDocument> {
    get(conn, id)?.ok_or_else(|| WorkflowError::not_found("invoice document", id))
}

/// Persist every mutable column of `doc`, guarded by its revision.
/// Returns the stored document with the bumped revision.
pub fn update(conn: &Connection, doc: &InvoiceDocument) -> Result<InvoiceDocument> {
    let updated_at = now();
    let changed = conn.execute(
        "UPDATE invoice_documents SET
            storage_handle = ?1, carrier = ?2, invoice_number = ?3, due_date = ?4,
            total_value = ?5, confidence_score = ?6, status = ?7, error_code = ?8,
            error_message = ?9, revision = revision + 1, updated_at = ?10
         WHERE id = ?11 AND revision = ?12",
        params![
            doc.storage_handle,
            doc.carrier,
            doc.invoice_number,
            doc.due_date.map(format_date),
            doc.total_value.map(|v| v.to_string()),
            doc.confidence_score,
            doc.status.as_str(),
            doc.error_code,
            doc.error_message,
            to_millis(updated_at),
            doc.id.to_string(),
            doc.revision,
        ],
    )?;
    if changed == 0 {
        return Err(WorkflowError::conflict(format!(
            "document {} changed since revision {}",
            doc.id, doc.revision
        )));
    }

    let mut stored = doc.clone();
    stored.revision += 1;
    stored.updated_at = updated_at;
    Ok(stored)
}

/// Move a document to `next` only if it is currently in one of `from`.
/// `None` means another writer got there first.
pub fn transition(
    conn: &Connection,
    id: Uuid,
    from: &[IntakeStatus],
    next: IntakeStatus,
) -> Result<Option<InvoiceDocument>> {
    let mut doc = require(conn, id)?;
    if !from.contains(&doc.status) {
        return Ok(None);
    }
    doc.status = next;
    update(conn, &doc).map(Some)
}

/// Documents the review queue shows: everything still moving, plus terminal
/// ones touched since `recent_since`.
pub fn list_inbox(conn: &Connection, recent_since: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM invoice_documents
         WHERE status IN ('INBOX', 'PROCESSING', 'OCR_RUNNING', 'PENDING_REVIEW')
            OR updated_at >= ?1
         ORDER BY created_at DESC, id"
    ))?;
    let rows = stmt.query_map(params![to_millis(recent_since)], row_to_document)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_by_status(conn: &Connection, status: IntakeStatus) -> Result<Vec<InvoiceDocument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM invoice_documents WHERE status = ?1 ORDER BY created_at DESC, id"
    ))?;
    let rows = stmt.query_map(params![status.as_str()], row_to_document)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// In-flight documents whose last write is older than `before`.
pub fn list_stalled(conn: &Connection, before: OffsetDateTime) -> Result<Vec<InvoiceDocument>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM invoice_documents
         WHERE status IN ('PROCESSING', 'OCR_RUNNING') AND updated_at < ?1"
    ))?;
    let rows = stmt.query_map(params![to_millis(before)], row_to_document)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Document counts for every intake status, zero-filled.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(IntakeStatus, usize)>> {
    let mut counts: Vec<(IntakeStatus, usize)> =
        IntakeStatus::ALL.into_iter().map(|s| (s, 0)).collect();

    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM invoice_documents GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((parsed::<IntakeStatus>(row, 0)?, row.get::<_, usize>(1)?)))?;
    for row in rows {
        let (status, count) = row?;
        if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
            slot.1 = count;
        }
    }
    Ok(counts)
}

/// Counts per status for documents created in `[from, until)`.
pub fn count_created_between(
    conn: &Connection,
    from: OffsetDateTime,
    until: OffsetDateTime,
) -> Result<Vec<(IntakeStatus, usize)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM invoice_documents
         WHERE created_at >= ?1 AND created_at < ?2 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![to_millis(from), to_millis(until)], |row| {
        Ok((parsed::<IntakeStatus>(row, 0)?, row.get::<_, usize>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
pub(crate) fn force_timestamps(conn: &Connection, id: Uuid, at: OffsetDateTime) -> Result<()> {
    conn.execute(
        "UPDATE invoice_documents SET created_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![to_millis(at), id.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::new_document;

    #[test]
    fn second_live_document_for_a_fingerprint_is_skipped() {
        let store = Store::open_in_memory().unwrap();

        let first = store
            .write(|tx| claim(tx, new_document("a.pdf", "fp-1")))
            .unwrap();
        let Claim::Fresh(first) = first else {
            panic!("first upload must be fresh");
        };

        let second = store
            .write(|tx| claim(tx, new_document("a-copy.pdf", "fp-1")))
            .unwrap();
        match second {
            Claim::Duplicate { document, existing } => {
                assert_eq!(existing, first.id);
                assert_eq!(document.status, IntakeStatus::Skipped);
                assert_eq!(document.duplicate_of, Some(first.id));
            }
            Claim::Fresh(_) => panic!("duplicate upload must be skipped"),
        }
    }

    #[test]
    fn unique_index_rejects_a_second_live_row() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|tx| insert(tx, &new_document("a.pdf", "fp-1")))
            .unwrap();

        let err = store
            .write(|tx| insert(tx, &new_document("b.pdf", "fp-1")))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Database(_)));
    }

    #[test]
    fn stale_revision_update_conflicts() {
        let store = Store::open_in_memory().unwrap();
        let doc = new_document("a.pdf", "fp-1");
        store.write(|tx| insert(tx, &doc)).unwrap();

        let mut edited = doc.clone();
        edited.carrier = Some("VIVO".into());
        let stored = store.write(|tx| update(tx, &edited)).unwrap();
        assert_eq!(stored.revision, doc.revision + 1);

        // writing again from the original snapshot must fail
        let err = store.write(|tx| update(tx, &edited)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn transition_only_from_expected_states() {
        let store = Store::open_in_memory().unwrap();
        let doc = new_document("a.pdf", "fp-1");
        store.write(|tx| insert(tx, &doc)).unwrap();

        let moved = store
            .write(|tx| transition(tx, doc.id, &[IntakeStatus::Inbox], IntakeStatus::Processing))
            .unwrap();
        assert_eq!(moved.unwrap().status, IntakeStatus::Processing);

        let again = store
            .write(|tx| transition(tx, doc.id, &[IntakeStatus::Inbox], IntakeStatus::Processing))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn counts_cover_every_status() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|tx| insert(tx, &new_document("a.pdf", "fp-1")))
            .unwrap();

        let counts = store.read(count_by_status).unwrap();
        assert_eq!(counts.len(), IntakeStatus::ALL.len());
        assert!(counts.contains(&(IntakeStatus::Inbox, 1)));
        assert!(counts.contains(&(IntakeStatus::Failed, 0)));
    }
}
