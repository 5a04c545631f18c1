//! Multi-format text extraction for evidence files.
//!
//! Converts raw bytes plus a declared or detected MIME type into normalized
//! UTF-8 text. The set of formats is a closed variant ([`DocumentKind`]) so
//! adding a format requires an explicit, compile-checked addition.
//!
//! Extraction is best-effort: recoverable issues (lossy decoding, malformed
//! XML substructure, empty output) produce warnings, not errors. Only a byte
//! stream that cannot be parsed as its declared type at all yields an
//! [`ExtractError`]. Unsupported types are a defined, non-fatal outcome:
//! empty text plus a warning.

use std::io::Read;

use crate::error::ExtractError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_HTML: &str = "text/html";
pub const MIME_TEXT: &str = "text/plain";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Closed set of document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    PlainText,
    Html,
    Unsupported,
}

impl DocumentKind {
    /// Detect the kind from the declared MIME hint first, then the filename
    /// extension, then magic bytes. Unknown binary content is Unsupported;
    /// valid UTF-8 with no other signal is treated as plain text.
    pub fn detect(mime_hint: Option<&str>, filename: &str, bytes: &[u8]) -> Self {
        if let Some(hint) = mime_hint {
            match hint {
                MIME_PDF => return DocumentKind::Pdf,
                MIME_DOCX => return DocumentKind::Docx,
                MIME_HTML | "application/xhtml+xml" => return DocumentKind::Html,
                _ if hint.starts_with("text/") => return DocumentKind::PlainText,
                _ => {}
            }
        }

        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".pdf") {
            return DocumentKind::Pdf;
        }
        if lower.ends_with(".docx") {
            return DocumentKind::Docx;
        }
        if lower.ends_with(".html") || lower.ends_with(".htm") {
            return DocumentKind::Html;
        }
        if lower.ends_with(".txt")
            || lower.ends_with(".md")
            || lower.ends_with(".log")
            || lower.ends_with(".csv")
        {
            return DocumentKind::PlainText;
        }

        if bytes.starts_with(b"%PDF") {
            return DocumentKind::Pdf;
        }
        if bytes.starts_with(b"PK\x03\x04") {
            let head = &bytes[..bytes.len().min(1000)];
            if contains_subslice(head, b"word/") {
                return DocumentKind::Docx;
            }
            return DocumentKind::Unsupported;
        }
        if bytes.starts_with(b"<") {
            return DocumentKind::Html;
        }

        if std::str::from_utf8(bytes).is_ok() {
            DocumentKind::PlainText
        } else {
            DocumentKind::Unsupported
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => MIME_PDF,
            DocumentKind::Docx => MIME_DOCX,
            DocumentKind::Html => MIME_HTML,
            DocumentKind::PlainText => MIME_TEXT,
            DocumentKind::Unsupported => "application/octet-stream",
        }
    }
}

/// Best-effort extraction output.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub kind: DocumentKind,
    pub text: String,
    pub warnings: Vec<String>,
}

/// Extract plain text from evidence bytes.
///
/// Never fails for recoverable issues; see the module docs for the contract.
pub fn extract(
    bytes: &[u8],
    mime_hint: Option<&str>,
    filename: &str,
) -> Result<Extracted, ExtractError> {
    let kind = DocumentKind::detect(mime_hint, filename, bytes);
    let mut warnings = Vec::new();

    let text = match kind {
        DocumentKind::Pdf => extract_pdf(bytes, &mut warnings)?,
        DocumentKind::Docx => extract_docx(bytes, &mut warnings)?,
        DocumentKind::Html => extract_html(bytes, &mut warnings),
        DocumentKind::PlainText => decode_text(bytes, &mut warnings),
        DocumentKind::Unsupported => {
            warnings.push(format!(
                "unsupported type: {}",
                mime_hint.unwrap_or("unknown")
            ));
            String::new()
        }
    };

    if text.trim().is_empty() && kind != DocumentKind::Unsupported {
        warnings.push(format!("no text content in {}", filename));
    }

    Ok(Extracted {
        kind,
        text,
        warnings,
    })
}

fn extract_pdf(bytes: &[u8], _warnings: &mut [String]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError {
        content_type: MIME_PDF.to_string(),
        byte_len: bytes.len(),
        details: e.to_string(),
    })
}

fn extract_docx(bytes: &[u8], warnings: &mut Vec<String>) -> Result<String, ExtractError> {
    let ooxml_err = |details: String| ExtractError {
        content_type: MIME_DOCX.to_string(),
        byte_len: bytes.len(),
        details,
    };

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ooxml_err(e.to_string()))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| ooxml_err("word/document.xml not found".to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ooxml_err(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ooxml_err("word/document.xml exceeds size limit".to_string()));
        }
    }

    extract_w_t_elements(&doc_xml, warnings).map_err(ooxml_err)
}

/// Walk the document XML and collect `w:t` runs, breaking on paragraph ends.
/// Malformed substructure is a warning; the walk stops there and returns
/// whatever was collected so far.
fn extract_w_t_elements(xml: &[u8], warnings: &mut Vec<String>) -> Result<String, String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        match te.unescape() {
                            Ok(text) => out.push_str(text.as_ref()),
                            Err(e) => warnings.push(format!("malformed text run: {}", e)),
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                if out.is_empty() {
                    return Err(e.to_string());
                }
                warnings.push(format!("document.xml truncated: {}", e));
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_html(bytes: &[u8], warnings: &mut Vec<String>) -> String {
    let html = decode_text(bytes, warnings);
    let document = scraper::Html::parse_document(&html);

    let mut out = String::new();
    for node in document.tree.nodes() {
        if let scraper::Node::Text(text) = node.value() {
            let skipped = node.ancestors().any(|a| match a.value() {
                scraper::Node::Element(el) => matches!(el.name(), "script" | "style"),
                _ => false,
            });
            if skipped {
                continue;
            }
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(trimmed);
            }
        }
    }
    out
}

fn decode_text(bytes: &[u8], warnings: &mut Vec<String>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            warnings.push("text decoded lossily (invalid UTF-8)".to_string());
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_extracts_verbatim() {
        let result = extract(b"hello evidence", Some("text/plain"), "note.txt").unwrap();
        assert_eq!(result.kind, DocumentKind::PlainText);
        assert_eq!(result.text, "hello evidence");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn unsupported_type_is_not_an_error() {
        let result = extract(&[0u8, 159, 146, 150], Some("image/png"), "photo.png").unwrap();
        assert_eq!(result.kind, DocumentKind::Unsupported);
        assert!(result.text.is_empty());
        assert!(result.warnings[0].contains("unsupported type"));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract(b"not a pdf", Some(MIME_PDF), "broken.pdf").unwrap_err();
        assert_eq!(err.content_type, MIME_PDF);
        assert_eq!(err.byte_len, 9);
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract(b"not a zip", Some(MIME_DOCX), "broken.docx").unwrap_err();
        assert_eq!(err.content_type, MIME_DOCX);
    }

    #[test]
    fn html_is_stripped_to_text() {
        let html = b"<html><head><style>p{color:red}</style></head>\
            <body><p>First line.</p><script>var x = 1;</script><p>Second line.</p></body></html>";
        let result = extract(html, Some("text/html"), "page.html").unwrap();
        assert_eq!(result.kind, DocumentKind::Html);
        assert!(result.text.contains("First line."));
        assert!(result.text.contains("Second line."));
        assert!(!result.text.contains("var x"));
        assert!(!result.text.contains("color:red"));
    }

    #[test]
    fn detection_falls_back_to_magic_bytes() {
        assert_eq!(
            DocumentKind::detect(None, "evidence.bin", b"%PDF-1.4\n%fake"),
            DocumentKind::Pdf
        );
        assert_eq!(
            DocumentKind::detect(None, "evidence.bin", b"<!DOCTYPE html><html></html>"),
            DocumentKind::Html
        );
        assert_eq!(
            DocumentKind::detect(None, "evidence.bin", b"just some words"),
            DocumentKind::PlainText
        );
        assert_eq!(
            DocumentKind::detect(None, "evidence.bin", &[0xff, 0xd8, 0xff, 0x00]),
            DocumentKind::Unsupported
        );
    }

    #[test]
    fn lossy_decode_warns_but_succeeds() {
        let mut bytes = b"latin text ".to_vec();
        bytes.push(0xe9); // latin-1 e-acute, invalid UTF-8
        let result = extract(&bytes, Some("text/plain"), "legacy.txt").unwrap();
        assert!(result.text.starts_with("latin text"));
        assert!(result.warnings.iter().any(|w| w.contains("lossily")));
    }

    #[test]
    fn empty_text_file_warns_but_succeeds() {
        let result = extract(b"", Some("text/plain"), "empty.txt").unwrap();
        assert!(result.text.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("no text content")));
    }
}
