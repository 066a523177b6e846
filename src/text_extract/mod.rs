//! Bytes → plain text contract (spec §1 "document text-extraction
//! libraries ... we describe only the contract"; SPEC_FULL §A `text_extract`).
//!
//! Dispatches on content type: `pdf_extract` for PDFs, `fs::read_to_string`-
//! style decoding for plain-text/markup, behind a trait so the pipeline can
//! call it uniformly regardless of source format.

use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Markdown,
    Html,
    Pdf,
}

impl DocumentKind {
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            "application/pdf" => DocumentKind::Pdf,
            "text/html" => DocumentKind::Html,
            "text/markdown" => DocumentKind::Markdown,
            _ => DocumentKind::PlainText,
        }
    }

    pub fn from_extension(extension: &str) -> Self {
        match extension.to_lowercase().as_str() {
            "pdf" => DocumentKind::Pdf,
            "html" | "htm" => DocumentKind::Html,
            "md" | "markdown" => DocumentKind::Markdown,
            _ => DocumentKind::PlainText,
        }
    }
}

/// Extracts plain text from `bytes`, given its `kind`. Callers then run the
/// result through [`preprocess`] before chunking (spec §4.2 "preprocessed
/// text").
pub fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String, CoreError> {
    match kind {
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| CoreError::InputInvalid(format!("failed to extract PDF text: {e}"))),
        DocumentKind::Html => {
            let raw = String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::InputInvalid(format!("not valid UTF-8: {e}")))?;
            Ok(strip_html_tags(&raw))
        }
        DocumentKind::Markdown | DocumentKind::PlainText => {
            String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::InputInvalid(format!("not valid UTF-8: {e}")))
        }
    }
}

/// A conservative tag stripper: good enough to turn simple HTML into
/// readable text without pulling in a full parser, which this crate's
/// dependency stack does not otherwise need.
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Normalizes raw extracted text per spec §4.2: CRLF→LF, runs of whitespace
/// collapsed, leading/trailing whitespace stripped. Blank lines (paragraph
/// breaks) are preserved since the chunker's paragraph strategy splits on
/// blank-line runs.
pub fn preprocess(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    let mut blank_run = 0usize;
    for line in normalized.lines() {
        let collapsed: String = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run <= 1 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&collapsed);
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_collapses_whitespace_and_normalizes_newlines() {
        let raw = "Hello   world\r\n\r\nSecond   paragraph  \r\n";
        let out = preprocess(raw);
        assert_eq!(out, "Hello world\n\nSecond paragraph");
    }

    #[test]
    fn plain_text_roundtrips() {
        let text = extract_text(b"hello there", DocumentKind::PlainText).unwrap();
        assert_eq!(text, "hello there");
    }

    #[test]
    fn html_tags_are_stripped() {
        let html = b"<p>Hello <b>world</b></p>";
        let text = extract_text(html, DocumentKind::Html).unwrap();
        assert_eq!(text, "Hello world");
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(DocumentKind::from_extension("PDF"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_extension("txt"), DocumentKind::PlainText);
    }
}
