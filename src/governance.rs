//! Report approval workflow: transition guards, audit history, manual
//! entry and dashboard aggregates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::config::ReportConfidenceConfig;
use crate::error::{Result, WorkflowError};
use crate::model::{
    ConfidenceBand, IntakeStatus, Report, ReportAction, ReportHistoryEntry, ReportStatus,
    SYSTEM_ACTOR,
};
use crate::store::reports::{self, LedgerRow, ReportFilter};
use crate::store::{Store, categories, documents, now};

/// Month-over-month change beyond which an insight is raised, in percent.
const SPEND_SWING_PERCENT: i64 = 10;

/// The human action that moves a report from `from` to `to`, or
/// `InvalidTransition` when the pair is not allowed.
pub fn guard(from: ReportStatus, to: ReportStatus) -> Result<ReportAction> {
    use ReportStatus::*;
    match (from, to) {
        (Pending, Review) => Ok(ReportAction::SubmitForReview),
        (Pending | Review, Canceled) => Ok(ReportAction::Cancel),
        (Review, Approved) => Ok(ReportAction::Approve),
        (Failed, Review) => Ok(ReportAction::Resubmit),
        _ => Err(WorkflowError::invalid_transition(from, to)),
    }
}

/// Move `report` to `to` and append its history entry, both on `conn`.
/// Callers run this inside one write transaction.
pub(crate) fn apply_transition(
    conn: &Connection,
    report: &Report,
    action: ReportAction,
    to: ReportStatus,
    actor: &str,
    comment: Option<&str>,
) -> Result<(Report, ReportHistoryEntry)> {
    reports::set_status(conn, report.id, report.status, to)?;
    let entry = reports::append_history(conn, report.id, action, report.status, to, actor, comment)?;
    let updated = reports::require(conn, report.id)?;
    info!(
        report = %report.id,
        action = action.as_str(),
        from = %report.status,
        to = %to,
        actor,
        "Report transitioned"
    );
    Ok((updated, entry))
}

/// System path into `FAILED`, used when the source document fails a
/// reprocess. Reports already past review are left alone.
pub(crate) fn mark_failed(conn: &Connection, report_id: Uuid) -> Result<Option<Report>> {
    let report = reports::require(conn, report_id)?;
    if !matches!(report.status, ReportStatus::Pending | ReportStatus::Review) {
        return Ok(None);
    }
    let (updated, _) = apply_transition(
        conn,
        &report,
        ReportAction::MarkFailed,
        ReportStatus::Failed,
        SYSTEM_ACTOR,
        None,
    )?;
    Ok(Some(updated))
}

/// Fields a user may set on a manually entered report.
#[derive(Debug, Clone)]
pub struct ReportDraft {
    pub title: String,
    pub reference_date: Date,
    pub due_date: Option<Date>,
    pub category_id: Uuid,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusTotal {
    pub status: ReportStatus,
    pub count: usize,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    /// One row per status, in `ReportStatus::ALL` order.
    pub by_status: Vec<StatusTotal>,
    /// Due before today and neither approved nor canceled.
    pub overdue: usize,
    pub overdue_total: Decimal,
}

/// Report values for one month of reference dates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthTotals {
    /// First day of the month.
    pub month: Date,
    /// Only statuses present that month, in `ReportStatus::ALL` order.
    pub by_status: Vec<(ReportStatus, Decimal)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarrierTotal {
    pub name: String,
    pub count: usize,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Insight {
    SpendUp { percent: Decimal },
    SpendDown { percent: Decimal },
    ImportErrors { count: usize },
    DuplicatesSkipped { count: usize },
}

impl fmt::Display for Insight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insight::SpendUp { percent } => {
                write!(f, "Spend up {percent}% on last month")
            }
            Insight::SpendDown { percent } => {
                write!(f, "Spend down {percent}% on last month")
            }
            Insight::ImportErrors { count } => {
                write!(f, "{count} invoice(s) failed to import and need attention")
            }
            Insight::DuplicatesSkipped { count } => {
                write!(f, "{count} duplicate invoice(s) were skipped")
            }
        }
    }
}

/// Month-to-date figures against the previous month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    pub current_month_total: Decimal,
    pub last_month_total: Decimal,
    /// Rounded to one decimal place. 100 when last month was empty.
    pub variation_percent: Decimal,
    /// Documents uploaded this month that ended `FAILED`.
    pub import_errors: usize,
    /// Documents uploaded this month that were skipped as duplicates.
    pub skipped: usize,
    /// Reports counted in `current_month_total`.
    pub report_count: usize,
    pub insights: Vec<Insight>,
}

fn month_start(date: Date) -> Date {
    date - Duration::days(i64::from(date.day()) - 1)
}

fn next_month_start(date: Date) -> Date {
    month_start(month_start(date) + Duration::days(32))
}

fn previous_month_start(date: Date) -> Date {
    month_start(month_start(date) - Duration::days(1))
}

/// Reports referenced in `[from, until)` that count as billed.
fn billed(ledger: &[LedgerRow], from: Date, until: Date) -> impl Iterator<Item = &LedgerRow> {
    ledger.iter().filter(move |row| {
        !matches!(row.status, ReportStatus::Canceled | ReportStatus::Failed)
            && row.reference_date >= from
            && row.reference_date < until
    })
}

/// Month-over-month change in percent, unrounded.
fn variation(current: Decimal, last: Decimal) -> Decimal {
    if last > Decimal::ZERO {
        (current - last) / last * Decimal::ONE_HUNDRED
    } else if current > Decimal::ZERO {
        Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

pub struct ReportWorkflow {
    store: Arc<Store>,
    bands: ReportConfidenceConfig,
}

impl ReportWorkflow {
    pub fn new(store: Arc<Store>, bands: ReportConfidenceConfig) -> Self {
        Self { store, bands }
    }

    /// Human-initiated transition. Cancel requires a non-blank comment; any
    /// comment on another action is not recorded.
    pub fn transition(
        &self,
        id: Uuid,
        to: ReportStatus,
        actor: &str,
        comment: Option<&str>,
    ) -> Result<(Report, ReportHistoryEntry)> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(WorkflowError::validation("actor is required"));
        }

        self.store.write(|tx| {
            let report = reports::require(tx, id)?;
            let action = guard(report.status, to)?;

            let comment = comment.map(str::trim).filter(|c| !c.is_empty());
            let comment = if action.requires_comment() {
                match comment {
                    Some(c) => Some(c),
                    None => {
                        return Err(WorkflowError::validation(
                            "a non-empty comment is required to cancel a report",
                        ));
                    }
                }
            } else {
                None
            };

            apply_transition(tx, &report, action, to, actor, comment)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Report> {
        self.store.read(|conn| reports::require(conn, id))
    }

    pub fn history(&self, id: Uuid) -> Result<Vec<ReportHistoryEntry>> {
        self.store.read(|conn| {
            reports::require(conn, id)?;
            reports::history(conn, id)
        })
    }

    pub fn list(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        if let (Some(min), Some(max)) = (filter.min_value, filter.max_value) {
            if min > max {
                return Err(WorkflowError::validation("min_value is greater than max_value"));
            }
        }
        self.store.read(|conn| reports::list(conn, filter))
    }

    pub fn create(&self, draft: ReportDraft) -> Result<Report> {
        validate_draft(&draft)?;
        let created_at = now();
        let report = Report {
            id: Uuid::new_v4(),
            title: draft.title.trim().to_string(),
            reference_date: draft.reference_date,
            due_date: draft.due_date,
            category_id: draft.category_id,
            total_value: draft.total_value,
            status: ReportStatus::Pending,
            invoice_source_id: None,
            confidence_score: None,
            requires_attention: false,
            created_at,
            updated_at: created_at,
        };

        self.store.write(|tx| {
            categories::require(tx, report.category_id)?;
            reports::insert(tx, &report)
        })?;
        info!(report = %report.id, title = %report.title, "Report created manually");
        Ok(report)
    }

    /// Rewrite a report's descriptive fields. Status only moves through
    /// `transition`.
    pub fn update(&self, id: Uuid, draft: ReportDraft) -> Result<Report> {
        validate_draft(&draft)?;
        let updated = self.store.write(|tx| {
            let mut report = reports::require(tx, id)?;
            if report.status.is_terminal() {
                return Err(WorkflowError::validation(format!(
                    "report {id} is {} and can no longer be edited",
                    report.status
                )));
            }
            categories::require(tx, draft.category_id)?;

            report.title = draft.title.trim().to_string();
            report.reference_date = draft.reference_date;
            report.due_date = draft.due_date;
            report.category_id = draft.category_id;
            report.total_value = draft.total_value;
            report.requires_attention = false;
            reports::update_fields(tx, &report)
        })?;
        info!(report = %id, "Report updated");
        Ok(updated)
    }

    pub fn summary(&self) -> Result<ReportSummary> {
        let ledger = self.store.read(reports::ledger)?;
        let today = OffsetDateTime::now_utc().date();

        let by_status = ReportStatus::ALL
            .into_iter()
            .map(|status| {
                let rows = ledger.iter().filter(|row| row.status == status);
                StatusTotal {
                    status,
                    count: rows.clone().count(),
                    total_value: rows.map(|row| row.total_value).sum(),
                }
            })
            .collect();

        let overdue: Vec<&LedgerRow> = ledger
            .iter()
            .filter(|row| !row.status.is_terminal() && row.due_date.is_some_and(|d| d < today))
            .collect();

        Ok(ReportSummary {
            by_status,
            overdue: overdue.len(),
            overdue_total: overdue.iter().map(|row| row.total_value).sum(),
        })
    }

    /// Totals per month of reference date and status, oldest first. Months
    /// without reports are absent.
    pub fn timeline(&self) -> Result<Vec<MonthTotals>> {
        let ledger = self.store.read(reports::ledger)?;
        let mut months: BTreeMap<Date, Vec<&LedgerRow>> = BTreeMap::new();
        for row in &ledger {
            months
                .entry(month_start(row.reference_date))
                .or_default()
                .push(row);
        }

        Ok(months
            .into_iter()
            .map(|(month, rows)| MonthTotals {
                month,
                by_status: ReportStatus::ALL
                    .into_iter()
                    .filter_map(|status| {
                        let mut matching = rows.iter().filter(|r| r.status == status).peekable();
                        matching.peek()?;
                        Some((status, matching.map(|r| r.total_value).sum()))
                    })
                    .collect(),
            })
            .collect())
    }

    /// Count and value per category, biggest spender first.
    pub fn carrier_totals(&self) -> Result<Vec<CarrierTotal>> {
        let ledger = self.store.read(reports::ledger)?;
        let mut by_name: BTreeMap<&str, (usize, Decimal)> = BTreeMap::new();
        for row in &ledger {
            let slot = by_name.entry(row.category.as_str()).or_default();
            slot.0 += 1;
            slot.1 += row.total_value;
        }

        let mut totals: Vec<CarrierTotal> = by_name
            .into_iter()
            .map(|(name, (count, total_value))| CarrierTotal {
                name: name.to_string(),
                count,
                total_value,
            })
            .collect();
        totals.sort_by(|a, b| b.total_value.cmp(&a.total_value).then_with(|| a.name.cmp(&b.name)));
        Ok(totals)
    }

    /// Spend this month against last month, by reference date, ignoring
    /// canceled and failed reports, plus this month's import problems.
    pub fn insights(&self, today: Date) -> Result<Insights> {
        let this_month = month_start(today);
        let next_month = next_month_start(today);
        let last_month = previous_month_start(today);

        let (ledger, uploads) = self.store.read(|conn| {
            let ledger = reports::ledger(conn)?;
            let uploads = documents::count_created_between(
                conn,
                this_month.midnight().assume_utc(),
                next_month.midnight().assume_utc(),
            )?;
            Ok((ledger, uploads))
        })?;

        let current: Vec<&LedgerRow> = billed(&ledger, this_month, next_month).collect();
        let current_month_total: Decimal = current.iter().map(|row| row.total_value).sum();
        let last_month_total: Decimal = billed(&ledger, last_month, this_month)
            .map(|row| row.total_value)
            .sum();

        let uploaded = |status: IntakeStatus| {
            uploads
                .iter()
                .find(|(s, _)| *s == status)
                .map_or(0, |(_, n)| *n)
        };
        let import_errors = uploaded(IntakeStatus::Failed);
        let skipped = uploaded(IntakeStatus::Skipped);

        let change = variation(current_month_total, last_month_total);
        let swing = Decimal::from(SPEND_SWING_PERCENT);
        let mut insights = Vec::new();
        if change > swing {
            insights.push(Insight::SpendUp {
                percent: change.round_dp(1),
            });
        } else if change < -swing {
            insights.push(Insight::SpendDown {
                percent: change.abs().round_dp(1),
            });
        }
        if import_errors > 0 {
            insights.push(Insight::ImportErrors {
                count: import_errors,
            });
        }
        if skipped > 0 {
            insights.push(Insight::DuplicatesSkipped { count: skipped });
        }

        Ok(Insights {
            current_month_total,
            last_month_total,
            variation_percent: change.round_dp(1),
            import_errors,
            skipped,
            report_count: current.len(),
            insights,
        })
    }

    pub fn confidence_band(&self, report: &Report) -> ConfidenceBand {
        self.bands.band(report.confidence_score)
    }
}

fn validate_draft(draft: &ReportDraft) -> Result<()> {
    if draft.title.trim().is_empty() {
        return Err(WorkflowError::validation("report title is required"));
    }
    if draft.total_value <= Decimal::ZERO {
        return Err(WorkflowError::validation("report value must be greater than zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dec, new_document, seed_category};
    use time::macros::{date, datetime};

    struct Fixture {
        workflow: ReportWorkflow,
        category: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let category = store.write(|tx| seed_category(tx, "Vivo")).unwrap().id;
        Fixture {
            workflow: ReportWorkflow::new(store, ReportConfidenceConfig::default()),
            category,
        }
    }

    fn draft(category_id: Uuid, value: &str) -> ReportDraft {
        ReportDraft {
            title: "INVOICE VIVO - March/2026".into(),
            reference_date: date!(2026 - 03 - 20),
            due_date: Some(date!(2026 - 03 - 20)),
            category_id,
            total_value: dec(value),
        }
    }

    #[test]
    fn guard_allows_only_listed_pairs() {
        use ReportStatus::*;
        for from in ReportStatus::ALL {
            for to in ReportStatus::ALL {
                let allowed = matches!(
                    (from, to),
                    (Pending, Review)
                        | (Pending, Canceled)
                        | (Review, Canceled)
                        | (Review, Approved)
                        | (Failed, Review)
                );
                assert_eq!(guard(from, to).is_ok(), allowed, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn pending_cannot_jump_to_approved() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();

        let err = f
            .workflow
            .transition(report.id, ReportStatus::Approved, "ana", None)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        assert_eq!(f.workflow.get(report.id).unwrap().status, ReportStatus::Pending);
        assert!(f.workflow.history(report.id).unwrap().is_empty());
    }

    #[test]
    fn cancel_with_blank_comment_changes_nothing() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        f.workflow
            .transition(report.id, ReportStatus::Review, "ana", None)
            .unwrap();

        for comment in [None, Some(""), Some("   \t")] {
            let err = f
                .workflow
                .transition(report.id, ReportStatus::Canceled, "ana", comment)
                .unwrap_err();
            assert!(err.is_validation());
        }
        assert_eq!(f.workflow.get(report.id).unwrap().status, ReportStatus::Review);
        assert_eq!(f.workflow.history(report.id).unwrap().len(), 1);
    }

    #[test]
    fn cancel_from_review_records_exactly_one_entry() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        f.workflow
            .transition(report.id, ReportStatus::Review, "ana", None)
            .unwrap();

        let (canceled, entry) = f
            .workflow
            .transition(report.id, ReportStatus::Canceled, "bruno", Some("duplicate charge"))
            .unwrap();
        assert_eq!(canceled.status, ReportStatus::Canceled);
        assert_eq!(entry.comment.as_deref(), Some("duplicate charge"));
        assert_eq!(entry.action, ReportAction::Cancel);
        assert_eq!(entry.actor, "bruno");

        let history = f.workflow.history(report.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], entry);
    }

    #[test]
    fn approval_drops_comments() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        f.workflow
            .transition(report.id, ReportStatus::Review, "ana", Some("looks fine"))
            .unwrap();
        let (approved, entry) = f
            .workflow
            .transition(report.id, ReportStatus::Approved, "ana", Some("ok"))
            .unwrap();

        assert_eq!(approved.status, ReportStatus::Approved);
        assert!(entry.comment.is_none());
        assert!(
            f.workflow
                .history(report.id)
                .unwrap()
                .iter()
                .all(|e| e.comment.is_none())
        );
    }

    #[test]
    fn terminal_reports_reject_every_transition_and_edit() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        f.workflow
            .transition(report.id, ReportStatus::Canceled, "ana", Some("wrong carrier"))
            .unwrap();

        for to in ReportStatus::ALL {
            assert!(
                f.workflow
                    .transition(report.id, to, "ana", Some("retry"))
                    .is_err()
            );
        }
        assert!(
            f.workflow
                .update(report.id, draft(f.category, "99.00"))
                .unwrap_err()
                .is_validation()
        );
    }

    #[test]
    fn failed_reports_can_only_be_resubmitted() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        let failed = f
            .workflow
            .store
            .write(|tx| mark_failed(tx, report.id))
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, ReportStatus::Failed);

        assert!(
            f.workflow
                .transition(report.id, ReportStatus::Approved, "ana", None)
                .is_err()
        );
        let (resubmitted, entry) = f
            .workflow
            .transition(report.id, ReportStatus::Review, "ana", None)
            .unwrap();
        assert_eq!(resubmitted.status, ReportStatus::Review);
        assert_eq!(entry.action, ReportAction::Resubmit);

        let history = f.workflow.history(report.id).unwrap();
        assert_eq!(history[0].action, ReportAction::MarkFailed);
        assert_eq!(history[0].actor, SYSTEM_ACTOR);
    }

    #[test]
    fn manual_writes_validate_value_and_category() {
        let f = fixture();
        assert!(f.workflow.create(draft(f.category, "0")).unwrap_err().is_validation());
        assert!(f.workflow.create(draft(f.category, "-5")).unwrap_err().is_validation());

        let err = f.workflow.create(draft(Uuid::new_v4(), "10.00")).unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
        assert!(f.workflow.list(&ReportFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn update_keeps_status() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "120.00")).unwrap();
        f.workflow
            .transition(report.id, ReportStatus::Review, "ana", None)
            .unwrap();

        let mut edit = draft(f.category, "130.50");
        edit.title = "Corrected".into();
        let updated = f.workflow.update(report.id, edit).unwrap();
        assert_eq!(updated.status, ReportStatus::Review);
        assert_eq!(updated.total_value, dec("130.50"));
        assert_eq!(f.workflow.get(report.id).unwrap().title, "Corrected");
    }

    #[test]
    fn summary_is_zero_filled_and_counts_overdue() {
        let f = fixture();
        let mut overdue = draft(f.category, "100.00");
        overdue.due_date = Some(OffsetDateTime::now_utc().date() - Duration::days(3));
        f.workflow.create(overdue).unwrap();

        let mut later = draft(f.category, "50.00");
        later.due_date = Some(OffsetDateTime::now_utc().date() + Duration::days(30));
        let approved = f.workflow.create(later).unwrap();
        f.workflow
            .transition(approved.id, ReportStatus::Review, "ana", None)
            .unwrap();

        let summary = f.workflow.summary().unwrap();
        assert_eq!(summary.by_status.len(), ReportStatus::ALL.len());
        assert_eq!(summary.overdue, 1);
        assert_eq!(summary.overdue_total, dec("100.00"));

        let pending = &summary.by_status[0];
        assert_eq!(pending.status, ReportStatus::Pending);
        assert_eq!((pending.count, pending.total_value), (1, dec("100.00")));
        let canceled = summary
            .by_status
            .iter()
            .find(|s| s.status == ReportStatus::Canceled)
            .unwrap();
        assert_eq!((canceled.count, canceled.total_value), (0, Decimal::ZERO));
    }

    #[test]
    fn inverted_value_range_is_rejected() {
        let f = fixture();
        let filter = ReportFilter {
            min_value: Some(dec("100")),
            max_value: Some(dec("10")),
            ..Default::default()
        };
        assert!(f.workflow.list(&filter).unwrap_err().is_validation());
    }

    fn report_on(f: &Fixture, category_id: Uuid, reference_date: Date, value: &str) -> Report {
        let mut d = draft(category_id, value);
        d.reference_date = reference_date;
        f.workflow.create(d).unwrap()
    }

    #[test]
    fn month_boundaries() {
        assert_eq!(month_start(date!(2026 - 03 - 31)), date!(2026 - 03 - 01));
        assert_eq!(next_month_start(date!(2026 - 01 - 31)), date!(2026 - 02 - 01));
        assert_eq!(next_month_start(date!(2025 - 12 - 01)), date!(2026 - 01 - 01));
        assert_eq!(previous_month_start(date!(2026 - 01 - 15)), date!(2025 - 12 - 01));
    }

    #[test]
    fn variation_against_an_empty_month() {
        assert_eq!(variation(dec("50"), Decimal::ZERO), dec("100"));
        assert_eq!(variation(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(variation(dec("80"), dec("100")), dec("-20"));
    }

    #[test]
    fn timeline_groups_by_month_and_status() {
        use ReportStatus::*;
        let f = fixture();
        report_on(&f, f.category, date!(2026 - 01 - 05), "10.00");
        report_on(&f, f.category, date!(2026 - 01 - 28), "15.50");
        let reviewed = report_on(&f, f.category, date!(2026 - 01 - 10), "4.00");
        f.workflow.transition(reviewed.id, Review, "ana", None).unwrap();
        report_on(&f, f.category, date!(2025 - 12 - 31), "7.00");

        let timeline = f.workflow.timeline().unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].month, date!(2025 - 12 - 01));
        assert_eq!(timeline[0].by_status, vec![(Pending, dec("7.00"))]);
        assert_eq!(timeline[1].month, date!(2026 - 01 - 01));
        assert_eq!(
            timeline[1].by_status,
            vec![(Pending, dec("25.50")), (Review, dec("4.00"))]
        );
    }

    #[test]
    fn carrier_totals_rank_by_value() {
        let f = fixture();
        let claro = f
            .workflow
            .store
            .write(|tx| seed_category(tx, "Claro"))
            .unwrap()
            .id;
        f.workflow.create(draft(f.category, "10.00")).unwrap();
        f.workflow.create(draft(f.category, "20.00")).unwrap();
        f.workflow.create(draft(claro, "45.00")).unwrap();

        let totals = f.workflow.carrier_totals().unwrap();
        let ranked: Vec<_> = totals
            .iter()
            .map(|t| (t.name.as_str(), t.count, t.total_value))
            .collect();
        assert_eq!(
            ranked,
            vec![("Claro", 1, dec("45.00")), ("Vivo", 2, dec("30.00"))]
        );
    }

    #[test]
    fn insights_compare_months_and_count_import_problems() {
        let f = fixture();
        report_on(&f, f.category, date!(2026 - 03 - 02), "150.00");
        report_on(&f, f.category, date!(2026 - 03 - 18), "50.00");
        let canceled = report_on(&f, f.category, date!(2026 - 03 - 05), "1000.00");
        f.workflow
            .transition(canceled.id, ReportStatus::Canceled, "ana", Some("wrong account"))
            .unwrap();
        report_on(&f, f.category, date!(2026 - 02 - 14), "100.00");

        for (status, fingerprint, created_at) in [
            (IntakeStatus::Failed, "f1", datetime!(2026-03-03 09:00 UTC)),
            (IntakeStatus::Skipped, "s1", datetime!(2026-03-04 09:00 UTC)),
            (IntakeStatus::Skipped, "s2", datetime!(2026-03-19 23:59 UTC)),
            (IntakeStatus::Failed, "f0", datetime!(2026-02-27 09:00 UTC)),
            (IntakeStatus::Confirmed, "c1", datetime!(2026-03-10 09:00 UTC)),
        ] {
            let mut doc = new_document("scan.pdf", fingerprint);
            doc.status = status;
            doc.created_at = created_at;
            doc.updated_at = created_at;
            f.workflow
                .store
                .write(|tx| documents::claim(tx, doc))
                .unwrap();
        }

        let insights = f.workflow.insights(date!(2026 - 03 - 20)).unwrap();
        assert_eq!(insights.current_month_total, dec("200.00"));
        assert_eq!(insights.last_month_total, dec("100.00"));
        assert_eq!(insights.variation_percent, dec("100.0"));
        assert_eq!(insights.report_count, 2);
        assert_eq!((insights.import_errors, insights.skipped), (1, 2));
        assert_eq!(
            insights.insights,
            vec![
                Insight::SpendUp {
                    percent: dec("100.0")
                },
                Insight::ImportErrors { count: 1 },
                Insight::DuplicatesSkipped { count: 2 },
            ]
        );
        assert_eq!(
            insights.insights[2].to_string(),
            "2 duplicate invoice(s) were skipped"
        );
    }

    #[test]
    fn small_swings_raise_no_spend_insight() {
        let f = fixture();
        report_on(&f, f.category, date!(2026 - 03 - 02), "105.00");
        report_on(&f, f.category, date!(2026 - 02 - 02), "100.00");

        let insights = f.workflow.insights(date!(2026 - 03 - 31)).unwrap();
        assert_eq!(insights.variation_percent, dec("5.0"));
        assert!(insights.insights.is_empty());

        let drop = f.workflow.insights(date!(2026 - 04 - 01)).unwrap();
        assert_eq!(drop.current_month_total, Decimal::ZERO);
        assert_eq!(drop.variation_percent, dec("-100.0"));
        assert_eq!(
            drop.insights,
            vec![Insight::SpendDown {
                percent: dec("100.0")
            }]
        );
    }

    #[test]
    fn manual_reports_have_the_lowest_band() {
        let f = fixture();
        let report = f.workflow.create(draft(f.category, "10.00")).unwrap();
        assert_eq!(f.workflow.confidence_band(&report), ConfidenceBand::Low);
    }
}
