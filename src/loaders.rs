//! Content extraction for each [`LoaderKind`].
//!
//! [`load_document`] reads one file, runs the loader the registry selected
//! for it, and attaches the file's metadata. Failures are reported as
//! [`Error::MalformedDocument`] so the loader pool can skip the file and
//! keep going.

use std::{borrow::Cow, path::Path, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    markup,
    metadata::{self, DocumentMetadata},
    office,
    registry::{Encoding, LoadMode, LoaderKind, LoaderSpec},
    vision::ImageDescriber,
};

/// What a loader produced. Bytes are only kept when the loader could not
/// decode them; the splitter makes a last attempt at coercion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DocumentContent {
    Text(String),
    Binary(Vec<u8>),
}

impl DocumentContent {
    /// Text view of the content, or `None` when bytes are not UTF-8.
    pub fn coerce_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Text(text) => Some(Cow::Borrowed(text)),
            Self::Binary(bytes) => std::str::from_utf8(strip_bom(bytes))
                .ok()
                .map(Cow::Borrowed),
        }
    }
}

/// One loaded file, before splitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDocument {
    pub content: DocumentContent,
    pub metadata: DocumentMetadata,
}

pub fn load_document(
    path: &Path,
    spec: &LoaderSpec,
    describer: Option<&dyn ImageDescriber>,
) -> Result<RawDocument> {
    let bytes = std::fs::read(path).map_err(|e| Error::malformed(path, e))?;

    let content = match spec.kind {
        LoaderKind::Text | LoaderKind::Markdown => decode(&bytes, spec.encoding),
        LoaderKind::Csv => match decode(&bytes, spec.encoding) {
            DocumentContent::Text(text) => {
                DocumentContent::Text(render_csv(path, &text, spec.mode)?)
            }
            binary => binary,
        },
        LoaderKind::Html => {
            map_text(decode(&bytes, spec.encoding), markup::html_to_text)
        }
        LoaderKind::Enex => map_text(decode(&bytes, spec.encoding), |t| {
            render_enex(t, spec.mode)
        }),
        LoaderKind::Pdf => DocumentContent::Text(load_pdf(path, spec.mode)?),
        LoaderKind::Docx => {
            DocumentContent::Text(office::load_docx(path, &bytes)?)
        }
        LoaderKind::Odt => {
            DocumentContent::Text(office::load_odt(path, &bytes)?)
        }
        LoaderKind::Spreadsheet => DocumentContent::Text(
            office::load_spreadsheet(path, &bytes, spec.mode)?,
        ),
        LoaderKind::Epub => {
            DocumentContent::Text(office::load_epub(path, &bytes, spec.mode)?)
        }
        LoaderKind::Email => DocumentContent::Text(load_email(path, &bytes)?),
        LoaderKind::Transcript => load_transcript(path, &bytes)?,
        LoaderKind::Image => {
            let describer = describer.ok_or_else(|| {
                Error::malformed(path, "no image describer configured")
            })?;
            DocumentContent::Text(describer.describe(path, &bytes)?)
        }
    };

    let metadata = metadata::extract(path, &bytes, spec)
        .map_err(|e| Error::malformed(path, e))?;

    Ok(RawDocument { content, metadata })
}

fn map_text(
    content: DocumentContent,
    f: impl FnOnce(&str) -> String,
) -> DocumentContent {
    match content {
        DocumentContent::Text(text) => DocumentContent::Text(f(&text)),
        binary => binary,
    }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes)
}

fn decode(bytes: &[u8], encoding: Encoding) -> DocumentContent {
    match std::str::from_utf8(strip_bom(bytes)) {
        Ok(text) => DocumentContent::Text(text.to_string()),
        Err(_) if encoding == Encoding::Utf8Autodetect => {
            DocumentContent::Text(decode_fallback(bytes))
        }
        Err(_) => DocumentContent::Binary(bytes.to_vec()),
    }
}

/// UTF-16 when a byte-order mark says so, Latin-1 otherwise.
fn decode_fallback(bytes: &[u8]) -> String {
    let utf16 = |body: &[u8], read: fn([u8; 2]) -> u16| {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| read([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    };

    if let Some(body) = bytes.strip_prefix(b"\xFF\xFE") {
        utf16(body, u16::from_le_bytes)
    } else if let Some(body) = bytes.strip_prefix(b"\xFE\xFF") {
        utf16(body, u16::from_be_bytes)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

// -- Tables --

/// Render each row as `header: value` lines. Rows with no content are
/// dropped.
pub(crate) fn labelled_rows(
    header: &[String],
    rows: impl Iterator<Item = Vec<String>>,
) -> Vec<String> {
    rows.filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, value)| {
                    let column = header.get(i).map_or("", String::as_str);
                    format!("{}: {}", column.trim(), value.trim())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}

/// Paragraph breaks between elements, or plain line breaks for a single
/// document body.
pub(crate) fn join_elements(elements: Vec<String>, mode: LoadMode) -> String {
    match mode {
        LoadMode::Elements => elements.join("\n\n"),
        LoadMode::Single => elements.join("\n"),
    }
}

fn render_csv(path: &Path, text: &str, mode: LoadMode) -> Result<String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| Error::malformed(path, e))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::malformed(path, e))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(join_elements(labelled_rows(&header, rows.into_iter()), mode))
}

// -- ENEX --

static ENEX_NOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<note>(.*?)</note>").expect("valid regex")
});
static ENEX_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title>(.*?)</title>").expect("valid regex")
});
static ENEX_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<content>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</content>")
        .expect("valid regex")
});

fn render_enex(xml: &str, mode: LoadMode) -> String {
    let notes: Vec<String> = ENEX_NOTE
        .captures_iter(xml)
        .map(|note| {
            let body = &note[1];
            let title = ENEX_TITLE
                .captures(body)
                .map(|c| {
                    let raw = c[1].trim();
                    quick_xml::escape::unescape(raw)
                        .map_or_else(|_| raw.to_string(), Cow::into_owned)
                })
                .unwrap_or_default();
            let content = ENEX_CONTENT
                .captures(body)
                .map(|c| markup::html_to_text(&c[1]))
                .unwrap_or_default();
            if title.is_empty() {
                content
            } else {
                format!("{title}\n{content}")
            }
        })
        .collect();

    join_elements(notes, mode)
}

// -- PDF --

fn load_pdf(path: &Path, mode: LoadMode) -> Result<String> {
    use pdf_oxide::PdfDocument;

    let mut doc =
        PdfDocument::open(path).map_err(|e| Error::malformed(path, e))?;
    let page_count = doc.page_count().map_err(|e| Error::malformed(path, e))?;

    let mut pages = Vec::new();
    for page_idx in 0..page_count {
        match doc.extract_text(page_idx) {
            Ok(text) => pages.push(text),
            Err(e) => tracing::debug!(
                path = %path.display(),
                page = page_idx + 1,
                "skipping unreadable page: {e}"
            ),
        }
    }

    if pages.is_empty() && page_count > 0 {
        return Err(Error::malformed(path, "no readable pages"));
    }

    Ok(match mode {
        LoadMode::Elements => pages.join("\n\n"),
        LoadMode::Single => pages.concat(),
    })
}

// -- Email --

fn load_email(path: &Path, bytes: &[u8]) -> Result<String> {
    use mail_parser::MessageParser;

    let parsed = MessageParser::default()
        .parse(bytes)
        .ok_or_else(|| Error::malformed(path, "not a MIME message"))?;

    let from = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .unwrap_or_default()
        .to_string();
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = parsed
        .body_text(0)
        .map(|s| s.to_string())
        .or_else(|| parsed.body_html(0).map(|h| markup::html_to_text(&h)))
        .unwrap_or_default();

    let mut text = format!("Subject: {subject}\n");
    if !from.is_empty() {
        text.push_str(&format!("From: {from}\n"));
    }
    text.push('\n');
    text.push_str(body.trim());
    Ok(text)
}

// -- Transcripts --

/// Accepts a serialized [`RawDocument`] as written to the audit trail, or
/// any JSON object with a `content`, `page_content` or `text` string.
#[derive(Deserialize)]
struct TranscriptFile {
    #[serde(alias = "page_content", alias = "text")]
    content: TranscriptContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptContent {
    Plain(String),
    Tagged(DocumentContent),
}

fn load_transcript(path: &Path, bytes: &[u8]) -> Result<DocumentContent> {
    let file: TranscriptFile =
        serde_json::from_slice(bytes).map_err(|e| Error::malformed(path, e))?;
    Ok(match file.content {
        TranscriptContent::Plain(text) => DocumentContent::Text(text),
        TranscriptContent::Tagged(content) => content,
    })
}
