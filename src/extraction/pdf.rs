//! Text layer of an uploaded PDF.

use lopdf::{Dictionary, Document};
use tracing::{debug, info};

use super::{CORRUPT_FILE, ExtractionFailure, UNSUPPORTED_LAYOUT};

/// Below this many non-whitespace characters the file is treated as a scan.
const MIN_TEXT_CHARS: usize = 50;
/// Share of image-only pages at which the whole file counts as scanned.
const SCANNED_PAGE_RATIO: f64 = 0.8;

#[derive(Debug, PartialEq, Eq)]
pub enum PdfText {
    Readable(String),
    /// No usable text layer. OCR is not attempted.
    ImageOnly,
    /// Not a PDF, or too damaged to open.
    Unreadable(String),
}

impl PdfText {
    pub fn into_text(self) -> Result<String, ExtractionFailure> {
        match self {
            PdfText::Readable(text) => Ok(text),
            PdfText::ImageOnly => Err(ExtractionFailure::new(
                UNSUPPORTED_LAYOUT,
                "document has no text layer (scanned or image-only)",
            )),
            PdfText::Unreadable(reason) => Err(ExtractionFailure::new(CORRUPT_FILE, reason)),
        }
    }
}

/// Blocking; run on a blocking thread.
pub fn read_text(bytes: &[u8]) -> PdfText {
    let doc = match Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(e) => return PdfText::Unreadable(format!("failed to parse PDF: {e}")),
    };

    let ratio = image_only_ratio(&doc);
    if ratio >= SCANNED_PAGE_RATIO {
        info!(ratio = format!("{ratio:.2}"), "PDF pages are image-only");
        return PdfText::ImageOnly;
    }

    let text = match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => text,
        Err(e) => {
            info!(error = %e, "No extractable text layer");
            return PdfText::ImageOnly;
        }
    };
    let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
    if meaningful < MIN_TEXT_CHARS {
        info!(chars = meaningful, "Text layer too thin, treating as scanned");
        return PdfText::ImageOnly;
    }
    debug!(chars = meaningful, "Text layer read");
    PdfText::Readable(text)
}

/// Fraction of pages that carry images but no fonts.
fn image_only_ratio(doc: &Document) -> f64 {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return 0.0;
    }

    let image_only = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok()?.as_dict().ok())
        .filter(|page| {
            let resources = resolve_dict(doc, page, b"Resources");
            let has = |key: &[u8]| {
                resources
                    .and_then(|res| resolve_dict(doc, res, key))
                    .is_some_and(|d| !d.is_empty())
            };
            has(b"XObject") && !has(b"Font")
        })
        .count();

    image_only as f64 / pages.len() as f64
}

fn resolve_dict<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    let object = dict.get(key).ok()?;
    let (_, resolved) = doc.dereference(object).ok()?;
    resolved.as_dict().ok()
}
