use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "md" => Some(Self::PlainText),
            _ => None,
        }
    }
}

/// Turns raw document bytes into one UTF-8 text blob. Pure function of its
/// inputs; no side effects.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], kind: DocumentKind) -> Result<String, RagError>;
}

#[derive(Debug, Default, Clone)]
pub struct StandardDocumentExtractor;

impl DocumentExtractor for StandardDocumentExtractor {
    fn extract(&self, bytes: &[u8], kind: DocumentKind) -> Result<String, RagError> {
        if bytes.is_empty() {
            return Err(RagError::Extraction("document is empty".to_string()));
        }

        let text = match kind {
            // Pages come out in order, separated by form feeds; the separators
            // are harmless downstream and left in place.
            DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes)
                .map_err(|err| RagError::Extraction(format!("unreadable PDF: {err}")))?,
            DocumentKind::PlainText => String::from_utf8(bytes.to_vec())
                .map_err(|_| RagError::Extraction("document is not valid UTF-8".to_string()))?,
        };

        if text.trim().is_empty() {
            return Err(RagError::Extraction(
                "document contains no extractable text".to_string(),
            ));
        }

        Ok(text)
    }
}
