//! Recursive text splitting for raw documents.
//!
//! Text is split on the coarsest separator present (paragraph breaks, then
//! line breaks, sentence ends, spaces and finally single characters). Pieces
//! that still exceed the chunk size are split again with the next finer
//! separator; pieces that fit are merged greedily up to the chunk size, and
//! the tail of each merged chunk (up to the overlap) is carried into the
//! next one.
//!
//! Lengths are counted in `char`s. Separators stay attached to the end of
//! the piece they terminate, so with an overlap of zero the chunks of a
//! document concatenate back to the document.

use std::collections::VecDeque;

use crate::{
    error::{Error, Result},
    loaders::RawDocument,
    metadata::DocumentMetadata,
    settings::Settings,
};

pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

/// A chunk of text cut from a larger document.
///
/// `metadata` is the parent document's metadata with `chunk_index` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub metadata: DocumentMetadata,
}

impl Chunk {
    /// Zero-based position of this chunk within its document.
    pub fn index(&self) -> usize {
        self.metadata.chunk_index.unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl ChunkSplitter {
    /// # Examples
    ///
    /// ```
    /// use docvault::chunking::ChunkSplitter;
    ///
    /// let splitter = ChunkSplitter::new(1000, 200).unwrap();
    /// let chunks = splitter.split_text("Hello, world!");
    /// assert_eq!(chunks, vec!["Hello, world!"]);
    ///
    /// assert!(ChunkSplitter::new(100, 100).is_err());
    /// ```
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.chunk_size, settings.chunk_overlap)
    }

    /// Replace the separator hierarchy, coarsest first. An empty string
    /// means "split into characters". Without it, a run with none of the
    /// separators is kept whole even when it exceeds the chunk size.
    pub fn with_separators(mut self, separators: Vec<String>) -> Result<Self> {
        if separators.is_empty() {
            return Err(Error::Config("separator list cannot be empty".into()));
        }
        self.separators = separators;
        Ok(self)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.split_recursive(text, &self.separators, &mut out);
        out
    }

    /// Split every document, skipping the ones whose content cannot be
    /// read as text.
    pub fn split_documents(&self, documents: &[RawDocument]) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for doc in documents {
            let Some(text) = doc.content.coerce_text() else {
                tracing::warn!(
                    path = %doc.metadata.file_path.display(),
                    "skipping document whose content is not text"
                );
                continue;
            };

            chunks.extend(self.split_text(&text).into_iter().enumerate().map(
                |(index, text)| Chunk {
                    text,
                    metadata: doc.metadata.with_chunk_index(index),
                },
            ));
        }

        chunks
    }

    fn split_recursive(
        &self,
        text: &str,
        separators: &[String],
        out: &mut Vec<String>,
    ) {
        let (separator, finer) = pick_separator(text, separators);

        let mut fitting: Vec<&str> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                self.merge(&fitting, out);
                fitting.clear();
            }

            if finer.is_empty() {
                push_chunk(out, piece.to_string());
            } else {
                self.split_recursive(piece, finer, out);
            }
        }

        if !fitting.is_empty() {
            self.merge(&fitting, out);
        }
    }

    /// Greedily pack consecutive pieces into chunks of at most
    /// `chunk_size`, carrying up to `chunk_overlap` trailing characters.
    fn merge(&self, pieces: &[&str], out: &mut Vec<String>) {
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0;

        for &piece in pieces {
            let len = char_len(piece);

            if total + len > self.chunk_size && !window.is_empty() {
                push_chunk(out, join(&window));

                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    let Some((_, dropped)) = window.pop_front() else {
                        break;
                    };
                    total -= dropped;
                }
            }

            window.push_back((piece, len));
            total += len;
        }

        if !window.is_empty() {
            push_chunk(out, join(&window));
        }
    }
}

/// First separator present in `text`, plus the finer ones after it.
fn pick_separator<'s>(
    text: &str,
    separators: &'s [String],
) -> (&'s str, &'s [String]) {
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            return ("", &[]);
        }
        if text.contains(sep.as_str()) {
            return (sep, &separators[i + 1..]);
        }
    }

    // None present: splitting on the last one leaves the text whole.
    let last = separators.last().map_or("", String::as_str);
    (last, &[])
}

fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        text.char_indices()
            .map(|(start, c)| &text[start..start + c.len_utf8()])
            .collect()
    } else {
        text.split_inclusive(separator).collect()
    }
}

fn join(window: &VecDeque<(&str, usize)>) -> String {
    window.iter().map(|(piece, _)| *piece).collect()
}

fn push_chunk(out: &mut Vec<String>, chunk: String) {
    if !chunk.trim().is_empty() {
        out.push(chunk);
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
