use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use rust_decimal::Decimal;
use time::Date;
use uuid::Uuid;

use super::{
    date_col, date_opt_col, format_date, now, parsed, parsed_opt, timestamp_col, to_millis,
};
use super::categories::name_key;
use crate::error::{Result, WorkflowError};
use crate::model::{Report, ReportAction, ReportHistoryEntry, ReportStatus};

const COLUMNS: &str = "r.id, r.title, r.reference_date, r.due_date, r.category_id, r.total_value,
     r.status, r.invoice_source_id, r.confidence_score, r.requires_attention, r.created_at,
     r.updated_at";

/// Criteria for listing reports. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub status: Option<ReportStatus>,
    pub category_id: Option<Uuid>,
    /// Case-insensitive substring of the category name.
    pub category_name: Option<String>,
    pub min_value: Option<Decimal>,
    pub max_value: Option<Decimal>,
    pub start_date: Option<Date>,
    pub end_date: Option<Date>,
    pub invoice_source_id: Option<Uuid>,
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<Report> {
    Ok(Report {
        id: parsed(row, 0)?,
        title: row.get(1)?,
        reference_date: date_col(row, 2)?,
        due_date: date_opt_col(row, 3)?,
        category_id: parsed(row, 4)?,
        total_value: parsed(row, 5)?,
        status: parsed(row, 6)?,
        invoice_source_id: parsed_opt(row, 7)?,
        confidence_score: row.get(8)?,
        requires_attention: row.get(9)?,
        created_at: timestamp_col(row, 10)?,
        updated_at: timestamp_col(row, 11)?,
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ReportHistoryEntry> {
    Ok(ReportHistoryEntry {
        id: row.get(0)?,
        report_id: parsed(row, 1)?,
        action: parsed::<ReportAction>(row, 2)?,
        from_status: parsed(row, 3)?,
        to_status: parsed(row, 4)?,
        actor: row.get(5)?,
        comment: row.get(6)?,
        created_at: timestamp_col(row, 7)?,
    })
}

pub fn insert(conn: &Connection, report: &Report) -> Result<()> {
    conn.execute(
        "INSERT INTO reports (id, title, reference_date, due_date, category_id, total_value,
            status, invoice_source_id, confidence_score, requires_attention, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            report.id.to_string(),
            report.title,
            format_date(report.reference_date),
            report.due_date.map(format_date),
            report.category_id.to_string(),
            report.total_value.to_string(),
            report.status.as_str(),
            report.invoice_source_id.map(|id| id.to_string()),
            report.confidence_score,
            report.requires_attention,
            to_millis(report.created_at),
            to_millis(report.updated_at),
        ],
    )?;
    Ok(())
}

/// Rewrite the descriptive fields. Status and the frozen confidence score
/// are never touched here.
pub fn update_fields(conn: &Connection, report: &Report) -> Result<Report> {
    let updated_at = now();
    let changed = conn.execute(
        "UPDATE reports SET title = ?1, reference_date = ?2, due_date = ?3, category_id = ?4,
            total_value = ?5, requires_attention = ?6, updated_at = ?7
         WHERE id = ?8",
        params![
            report.title,
            format_date(report.reference_date),
            report.due_date.map(format_date),
            report.category_id.to_string(),
            report.total_value.to_string(),
            report.requires_attention,
            to_millis(updated_at),
            report.id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(WorkflowError::not_found("report", report.id));
    }
    let mut stored = report.clone();
    stored.updated_at = updated_at;
    Ok(stored)
}

/// Compare-and-set on status. Fails with `Conflict` when the row moved.
pub fn set_status(
    conn: &Connection,
    id: Uuid,
    expected: ReportStatus,
    next: ReportStatus,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE reports SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![next.as_str(), to_millis(now()), id.to_string(), expected.as_str()],
    )?;
    if changed == 0 {
        return Err(WorkflowError::conflict(format!(
            "report {id} is no longer {expected}"
        )));
    }
    Ok(())
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Option<Report>> {
    let report = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM reports r WHERE r.id = ?1"),
            params![id.to_string()],
            row_to_report,
        )
        .optional()?;
    Ok(report)
}

pub fn require(conn: &Connection, id: Uuid) -> Result<Report> {
    get(conn, id)?.ok_or_else(|| WorkflowError::not_found("report", id))
}

pub fn find_by_source(conn: &Connection, document_id: Uuid) -> Result<Option<Report>> {
    let report = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM reports r WHERE r.invoice_source_id = ?1"),
            params![document_id.to_string()],
            row_to_report,
        )
        .optional()?;
    Ok(report)
}

pub fn list(conn: &Connection, filter: &ReportFilter) -> Result<Vec<Report>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        clauses.push("r.status = ?");
        args.push(Box::new(status.as_str()));
    }
    if let Some(category_id) = filter.category_id {
        clauses.push("r.category_id = ?");
        args.push(Box::new(category_id.to_string()));
    }
    if let Some(name) = &filter.category_name {
        clauses.push("c.name_key LIKE ? ESCAPE '\\'");
        args.push(Box::new(format!("%{}%", escape_like(&name_key(name)))));
    }
    if let Some(start) = filter.start_date {
        clauses.push("r.reference_date >= ?");
        args.push(Box::new(format_date(start)));
    }
    if let Some(end) = filter.end_date {
        clauses.push("r.reference_date <= ?");
        args.push(Box::new(format_date(end)));
    }
    if let Some(source) = filter.invoice_source_id {
        clauses.push("r.invoice_source_id = ?");
        args.push(Box::new(source.to_string()));
    }

    let mut sql = format!("SELECT {COLUMNS} FROM reports r JOIN categories c ON c.id = r.category_id");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY r.reference_date DESC, r.created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let rows = stmt.query_map(params.as_slice(), row_to_report)?;
    let reports = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    // values are stored as decimal text, so range filters run here
    Ok(reports
        .into_iter()
        .filter(|r| filter.min_value.is_none_or(|min| r.total_value >= min))
        .filter(|r| filter.max_value.is_none_or(|max| r.total_value <= max))
        .collect())
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub fn append_history(
    conn: &Connection,
    report_id: Uuid,
    action: ReportAction,
    from: ReportStatus,
    to: ReportStatus,
    actor: &str,
    comment: Option<&str>,
) -> Result<ReportHistoryEntry> {
    let created_at = now();
    conn.execute(
        "INSERT INTO report_history (report_id, action, from_status, to_status, actor, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            report_id.to_string(),
            action.as_str(),
            from.as_str(),
            to.as_str(),
            actor,
            comment,
            to_millis(created_at),
        ],
    )?;
    Ok(ReportHistoryEntry {
        id: conn.last_insert_rowid(),
        report_id,
        action,
        from_status: from,
        to_status: to,
        actor: actor.to_string(),
        comment: comment.map(str::to_string),
        created_at,
    })
}

pub fn history(conn: &Connection, report_id: Uuid) -> Result<Vec<ReportHistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, report_id, action, from_status, to_status, actor, comment, created_at
         FROM report_history WHERE report_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![report_id.to_string()], row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// What the dashboard aggregates over, one per report.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub status: ReportStatus,
    pub total_value: Decimal,
    pub reference_date: Date,
    pub due_date: Option<Date>,
    pub category: String,
}

// decimals are stored as text, so sums happen in Rust
pub fn ledger(conn: &Connection) -> Result<Vec<LedgerRow>> {
    let mut stmt = conn.prepare(
        "SELECT r.status, r.total_value, r.reference_date, r.due_date, c.name
         FROM reports r JOIN categories c ON c.id = r.category_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(LedgerRow {
            status: parsed(row, 0)?,
            total_value: parsed(row, 1)?,
            reference_date: date_col(row, 2)?,
            due_date: date_opt_col(row, 3)?,
            category: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_for_category(conn: &Connection, category_id: Uuid) -> Result<usize> {
    let count: usize = conn.query_row(
        "SELECT COUNT(*) FROM reports WHERE category_id = ?1",
        params![category_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}
