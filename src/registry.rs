//! Maps file extensions to the loader that knows how to read them.

use std::{collections::BTreeMap, fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which content extractor handles a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Text,
    Markdown,
    Csv,
    Html,
    Enex,
    Pdf,
    /// Word 2007+ document.
    Docx,
    /// OpenDocument text.
    Odt,
    /// Excel 2007+ workbook.
    Spreadsheet,
    Epub,
    Email,
    Transcript,
    Image,
}

/// Whether a loader returns its native whole-file text, or the file's
/// elements (pages, rows) separated by paragraph breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Single,
    Elements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Strict UTF-8. Undecodable files are handed on as raw bytes.
    Utf8,
    /// UTF-8, falling back to byte-order-mark detection and then Latin-1.
    Utf8Autodetect,
    /// The loader parses bytes itself.
    Binary,
}

/// Coarse category recorded in every chunk's metadata and used by the
/// `document_type` query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Document,
    Image,
    Audio,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability descriptor returned by [`FormatRegistry::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSpec {
    pub kind: LoaderKind,
    pub mode: LoadMode,
    pub encoding: Encoding,
    pub document_type: DocumentType,
}

impl LoaderSpec {
    const fn new(kind: LoaderKind, mode: LoadMode, encoding: Encoding) -> Self {
        Self {
            kind,
            mode,
            encoding,
            document_type: DocumentType::Document,
        }
    }

    const fn with_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = document_type;
        self
    }
}

const TEXT: LoaderSpec =
    LoaderSpec::new(LoaderKind::Text, LoadMode::Single, Encoding::Utf8Autodetect);
const MARKDOWN: LoaderSpec =
    LoaderSpec::new(LoaderKind::Markdown, LoadMode::Single, Encoding::Utf8);
const CSV: LoaderSpec = LoaderSpec::new(
    LoaderKind::Csv,
    LoadMode::Elements,
    Encoding::Utf8Autodetect,
);
const HTML: LoaderSpec =
    LoaderSpec::new(LoaderKind::Html, LoadMode::Single, Encoding::Utf8);
const ENEX: LoaderSpec =
    LoaderSpec::new(LoaderKind::Enex, LoadMode::Elements, Encoding::Utf8);
const PDF: LoaderSpec =
    LoaderSpec::new(LoaderKind::Pdf, LoadMode::Elements, Encoding::Binary);
const DOCX: LoaderSpec =
    LoaderSpec::new(LoaderKind::Docx, LoadMode::Single, Encoding::Binary);
const ODT: LoaderSpec =
    LoaderSpec::new(LoaderKind::Odt, LoadMode::Single, Encoding::Binary);
const SPREADSHEET: LoaderSpec = LoaderSpec::new(
    LoaderKind::Spreadsheet,
    LoadMode::Elements,
    Encoding::Binary,
);
const EPUB: LoaderSpec =
    LoaderSpec::new(LoaderKind::Epub, LoadMode::Elements, Encoding::Binary);
const EMAIL: LoaderSpec =
    LoaderSpec::new(LoaderKind::Email, LoadMode::Single, Encoding::Binary);
const TRANSCRIPT: LoaderSpec =
    LoaderSpec::new(LoaderKind::Transcript, LoadMode::Single, Encoding::Utf8)
        .with_type(DocumentType::Audio);
const IMAGE: LoaderSpec =
    LoaderSpec::new(LoaderKind::Image, LoadMode::Single, Encoding::Binary)
        .with_type(DocumentType::Image);

const STANDARD: &[(&str, LoaderSpec)] = &[
    ("txt", TEXT),
    ("text", TEXT),
    ("log", TEXT),
    ("md", MARKDOWN),
    ("markdown", MARKDOWN),
    ("csv", CSV),
    ("html", HTML),
    ("htm", HTML),
    ("enex", ENEX),
    ("pdf", PDF),
    ("docx", DOCX),
    ("odt", ODT),
    ("xlsx", SPREADSHEET),
    ("xlsm", SPREADSHEET),
    ("epub", EPUB),
    ("eml", EMAIL),
    ("json", TRANSCRIPT),
    ("png", IMAGE),
    ("jpg", IMAGE),
    ("jpeg", IMAGE),
    ("bmp", IMAGE),
    ("gif", IMAGE),
    ("tif", IMAGE),
    ("tiff", IMAGE),
];

/// Static extension -> loader table.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    loaders: BTreeMap<String, LoaderSpec>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every format the crate can read.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for (ext, spec) in STANDARD {
            registry.register(ext, *spec);
        }
        registry
    }

    /// The standard table, minus images when no image describer is
    /// configured.
    pub fn for_vision_model(vision_model: &str) -> Self {
        let mut registry = Self::standard();
        if vision_model == crate::vision::DISABLED {
            registry
                .loaders
                .retain(|_, spec| spec.kind != LoaderKind::Image);
        }
        registry
    }

    pub fn register(&mut self, extension: &str, spec: LoaderSpec) {
        self.loaders.insert(normalize(extension), spec);
    }

    /// Case-insensitive; a leading dot is ignored.
    pub fn lookup(&self, extension: &str) -> Result<&LoaderSpec> {
        let ext = normalize(extension);
        self.loaders
            .get(&ext)
            .ok_or(Error::UnsupportedFormat { extension: ext })
    }

    pub fn lookup_path(&self, path: &Path) -> Result<&LoaderSpec> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        self.lookup(ext)
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.lookup_path(path).is_ok()
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }
}

fn normalize(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}
