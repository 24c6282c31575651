//! Finds invoices filed as `Year/City/Carrier/Month/*.pdf` under a root
//! folder.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// A PDF found in the folder layout, with the metadata its path carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundInvoice {
    pub path: PathBuf,
    pub year: String,
    pub city: String,
    pub carrier: String,
    pub month: String,
    pub filename: String,
}

/// Blocking; run on a blocking thread. Results are sorted by path.
pub fn scan(root: &Path) -> io::Result<Vec<FoundInvoice>> {
    let mut found = Vec::new();
    walk(root, root, &mut found)?;
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

fn walk(root: &Path, dir: &Path, found: &mut Vec<FoundInvoice>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(root, &path, found)?;
        } else if is_pdf(&path) {
            match classify(root, &path) {
                Some(invoice) => found.push(invoice),
                None => debug!(path = %path.display(), "PDF outside the folder layout ignored"),
            }
        }
    }
    Ok(())
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

fn classify(root: &Path, path: &Path) -> Option<FoundInvoice> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    // year, city, carrier, month, then at least the file itself
    if parts.len() < 5 {
        return None;
    }
    Some(FoundInvoice {
        path: path.to_path_buf(),
        year: parts[0].clone(),
        city: parts[1].clone(),
        carrier: parts[2].clone(),
        month: parts[3].clone(),
        filename: parts[parts.len() - 1].clone(),
    })
}
