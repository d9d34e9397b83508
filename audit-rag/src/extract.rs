//! Turning raw document bytes into pages.
//!
//! Real deployments plug in a PDF/OCR backend through [`PageExtractor`];
//! [`PlainTextExtractor`] handles UTF-8 text with form-feed page breaks.

use crate::document::Page;
use crate::error::{AuditError, Result};

/// Converts a raw document into an ordered list of pages.
///
/// Fails with [`AuditError::UnreadableDocument`] on corrupt input. Pages with
/// empty text are allowed.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>>;
}

/// Reads UTF-8 text; each form feed (`\x0c`) starts a new page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl PageExtractor for PlainTextExtractor {
    fn extract(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>> {
        let text = std::str::from_utf8(bytes).map_err(|e| AuditError::UnreadableDocument {
            document: document_name.to_string(),
            reason: format!("not valid UTF-8 text ({e})"),
        })?;
        if text.contains('\0') {
            return Err(AuditError::UnreadableDocument {
                document: document_name.to_string(),
                reason: "binary content".to_string(),
            });
        }
        Ok(text
            .split('\x0c')
            .enumerate()
            .map(|(i, page)| Page { page_number: i as u32 + 1, text: page.to_string() })
            .collect())
    }
}
