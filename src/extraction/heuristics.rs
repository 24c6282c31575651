//! Keyword-anchored regex extraction for carrier invoices.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rust_decimal::Decimal;
use time::{Date, Month};
use tracing::info;

use super::{ExtractedInvoice, ExtractionFailure, Extractor, SERVICE_ERROR, pdf};

/// Amount in `1.234,56`, `1,234.56` or `1234,56` notation. Anchored on word
/// boundaries so a match never starts or ends inside a longer number.
const AMOUNT: &str = r"\b((?:\d{1,3}(?:[.,]\d{3})+|\d+)[.,]\d{2})\b";
const DAY: &str = r"(\d{2}/\d{2}/\d{4})";

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("invoice pattern must compile")
}

static PRIMARY_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(&format!(
        r"(?i)(?:Total a pagar|VALOR TOTAL|Total desta fatura|Valor a pagar|Amount due|Total due)\s*:?\s*(?:R\$|US\$|\$)?\s*{AMOUNT}"
    ))
});

static PRIMARY_DUE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(&format!(
        r"(?i)(?:Data de vencimento|Vencimento|Vence em|Pague até|Due date)\s*:?\s*{DAY}"
    ))
});

static PRIMARY_INVOICE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)(?:Fatura número|Nº da fatura|Conta No\.|Invoice No\.?)\s*:?\s*(\d+)")
});

// summary sidebars, card layouts and fixed-line bills
static LABELLED_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    pattern(&format!(
        r"(?i)(?:TOTAL GERAL A PAGAR|TOTAL A PAGAR|Total Geral|Resumo|VALOR \(R\$\))[\s\S]{{0,50}}?{AMOUNT}"
    ))
});

static LOOSE_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| pattern(&format!(r"(?i)valor.*?{AMOUNT}")));

static ANY_DAY: LazyLock<Regex> = LazyLock::new(|| pattern(DAY));

static FALLBACK_INVOICE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)Fatura\D{0,20}(\d{7,15})"));

const CONFIDENCE_PRIMARY: u8 = 100;
const CONFIDENCE_FALLBACK: u8 = 80;
const CONFIDENCE_PARTIAL: u8 = 50;

/// Local extractor: PDF text layer plus regex heuristics. No network.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicExtractor;

#[async_trait]
impl Extractor for HeuristicExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedInvoice, ExtractionFailure> {
        let bytes = bytes.to_vec();
        let content = tokio::task::spawn_blocking(move || pdf::read_text(&bytes))
            .await
            .map_err(|e| ExtractionFailure::new(SERVICE_ERROR, e))?;
        let text = content.into_text()?;

        let invoice = extract_invoice(&text);
        let (filled, total) = invoice.coverage();
        info!(
            filled,
            total,
            carrier = ?invoice.carrier,
            invoice_number = ?invoice.invoice_number,
            total_value = ?invoice.total_value,
            confidence = invoice.confidence_score,
            "Heuristic extraction result"
        );
        Ok(invoice)
    }
}

/// Extract invoice fields from raw PDF text. Fallback patterns only run when
/// a primary pattern misses, and each step down lowers the confidence.
pub fn extract_invoice(text: &str) -> ExtractedInvoice {
    let mut invoice = ExtractedInvoice {
        carrier: detect_carrier(text),
        ..Default::default()
    };
    if text.trim().is_empty() {
        return invoice;
    }

    invoice.total_value = primary_total(text);
    invoice.due_date = primary_due_date(text);
    invoice.invoice_number = primary_invoice_number(text);
    invoice.confidence_score = CONFIDENCE_PRIMARY;

    if invoice.total_value.is_none()
        || invoice.due_date.is_none()
        || invoice.invoice_number.is_none()
    {
        invoice.confidence_score = CONFIDENCE_FALLBACK;
        invoice.total_value = invoice.total_value.or_else(|| fallback_total(text));
        invoice.due_date = invoice.due_date.or_else(|| fallback_due_date(text));
        invoice.invoice_number = invoice
            .invoice_number
            .or_else(|| fallback_invoice_number(text));

        if invoice.total_value.is_none() || invoice.due_date.is_none() {
            invoice.confidence_score = CONFIDENCE_PARTIAL;
        }
    }

    invoice
}

pub fn detect_carrier(text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    if upper.contains("VIVO") || upper.contains("TELEFONICA") {
        Some("VIVO".to_string())
    } else if upper.contains("CLARO") || upper.contains("EMBRATEL") {
        Some("CLARO".to_string())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Primary patterns
// ---------------------------------------------------------------------------

fn primary_total(text: &str) -> Option<Decimal> {
    max_amount(&PRIMARY_TOTAL, text)
}

fn primary_due_date(text: &str) -> Option<Date> {
    PRIMARY_DUE_DATE
        .captures_iter(text)
        .find_map(|c| parse_day(&c[1]))
}

fn primary_invoice_number(text: &str) -> Option<String> {
    PRIMARY_INVOICE_NUMBER
        .captures(text)
        .map(|c| c[1].to_string())
}

// ---------------------------------------------------------------------------
// Fallback patterns
// ---------------------------------------------------------------------------

fn fallback_total(text: &str) -> Option<Decimal> {
    [max_amount(&LABELLED_TOTAL, text), max_amount(&LOOSE_TOTAL, text)]
        .into_iter()
        .flatten()
        .max()
}

fn fallback_due_date(text: &str) -> Option<Date> {
    // the due date is usually the latest date in the header
    ANY_DAY
        .captures_iter(text)
        .filter_map(|c| parse_day(&c[1]))
        .max()
}

fn fallback_invoice_number(text: &str) -> Option<String> {
    FALLBACK_INVOICE_NUMBER
        .captures(text)
        .map(|c| c[1].to_string())
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

fn max_amount(re: &Regex, text: &str) -> Option<Decimal> {
    re.captures_iter(text)
        .filter_map(|c| parse_amount(&c[1]))
        .max()
}

/// The last separator followed by exactly two digits is the decimal mark.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    let decimal_mark = raw.rfind(['.', ','])?;
    if raw.len() - decimal_mark != 3 {
        return None;
    }
    let whole: String = raw[..decimal_mark]
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let cents = &raw[decimal_mark + 1..];
    format!("{whole}.{cents}").parse::<Decimal>().ok()
}

/// `dd/mm/yyyy`
pub fn parse_day(raw: &str) -> Option<Date> {
    let mut parts = raw.split('/');
    let day: u8 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let year: i32 = parts.next()?.parse().ok()?;
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(year, month, day).ok()
}
