//! Content metadata and the catalog seam to the content store
//!
//! The core never keeps lesson text. Registered material is reduced to
//! `ContentMetadata` on arrival and only that is retained.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

pub mod adapt;
pub mod readability;

pub use adapt::{generate_adaptation, AdaptedContent};

/// Non-identifying description of a piece of lesson content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub content_ref: String,
    pub course_id: String,
    /// Flesch-Kincaid grade level
    pub reading_grade: f64,
    pub word_count: u32,
    /// Share of words with three or more syllables
    pub complex_word_ratio: f64,
    pub jargon_terms: Vec<String>,
    pub has_examples: bool,
    pub is_structured: bool,
}

impl ContentMetadata {
    /// Derive metadata from lesson text
    pub fn from_text(content_ref: impl Into<String>, course_id: impl Into<String>, text: &str) -> Self {
        let words = readability::words(text);
        let complex = words
            .iter()
            .filter(|w| readability::syllables(w) >= 3)
            .count();
        let complex_word_ratio = if words.is_empty() {
            0.0
        } else {
            complex as f64 / words.len() as f64
        };

        Self {
            content_ref: content_ref.into(),
            course_id: course_id.into(),
            reading_grade: readability::flesch_kincaid_grade(text),
            word_count: words.len() as u32,
            complex_word_ratio,
            jargon_terms: readability::jargon_terms(text),
            has_examples: readability::has_examples(text),
            is_structured: readability::is_structured(text),
        }
    }
}

/// Source of content metadata for the orchestrator
///
/// Implementations backed by a remote store report outages as
/// `Error::UpstreamUnavailable`.
pub trait ContentCatalog: Send + Sync {
    fn metadata(&self, content_ref: &str) -> Result<ContentMetadata>;
}

/// In-process catalog fed through `register-content`
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<String, ContentMetadata>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze and register lesson text; the text itself is not kept
    pub fn register(&self, content_ref: &str, course_id: &str, text: &str) -> ContentMetadata {
        let metadata = ContentMetadata::from_text(content_ref, course_id, text);
        self.insert(metadata.clone());
        metadata
    }

    pub fn insert(&self, metadata: ContentMetadata) {
        debug!(
            "Registered content {} (grade {:.1})",
            metadata.content_ref, metadata.reading_grade
        );
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(metadata.content_ref.clone(), metadata);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentCatalog for InMemoryCatalog {
    fn metadata(&self, content_ref: &str) -> Result<ContentMetadata> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(content_ref).cloned().ok_or_else(|| {
            Error::UpstreamUnavailable(format!("content store has no metadata for {}", content_ref))
        })
    }
}
