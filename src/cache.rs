//! Build cache for citation and bibliography bookkeeping.
//!
//! The cache carries everything that must survive outside a single
//! document: parsed bibliography file snapshots, per-directive
//! configuration and label assignments, which keys each document cites,
//! and the running enumeration counters. It is persisted to disk between
//! incremental builds, so every field is plain serializable data.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bibfile::BibliographyData;
use crate::filter::FilterExpr;

/// Errors raised by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Registering the same directive id twice for one document. This is a
    /// caller contract violation, not a recoverable runtime condition.
    #[error("bibliography directive '{id}' already registered for document '{docname}'")]
    DuplicateDirective { docname: String, id: String },

    #[error("no bibliography directive '{id}' registered for document '{docname}'")]
    DirectiveNotFound { docname: String, id: String },

    #[error("could not find bibtex key {key}")]
    LabelNotFound { key: String },

    /// The enumeration counter was read before being initialized. Distinct
    /// from a counter that is present with value zero.
    #[error("enumeration counter not initialized for document '{docname}'")]
    CounterNotInitialized { docname: String },

    #[error("cache file has schema version {found}, expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("failed to read or write cache file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid cache file: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// How a bibliography directive renders its entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    /// Citation-style list: each entry prefixed with its label.
    #[default]
    Citation,
    Bullet,
    Enumerated,
}

/// Ordinal formatting for enumerated lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnumType {
    #[default]
    Arabic,
    LowerAlpha,
    UpperAlpha,
    LowerRoman,
    UpperRoman,
}

impl EnumType {
    /// Formats an ordinal in this numbering style (1 -> "1", "a", "A",
    /// "i", or "I").
    pub fn format(self, ordinal: usize) -> String {
        match self {
            EnumType::Arabic => ordinal.to_string(),
            EnumType::LowerAlpha => to_alpha(ordinal),
            EnumType::UpperAlpha => to_alpha(ordinal).to_uppercase(),
            EnumType::LowerRoman => to_roman(ordinal).to_lowercase(),
            EnumType::UpperRoman => to_roman(ordinal),
        }
    }
}

/// Spreadsheet-style alphabetic numbering: 1 -> "a", 26 -> "z", 27 -> "aa".
fn to_alpha(mut ordinal: usize) -> String {
    if ordinal == 0 {
        return "0".to_string();
    }
    let mut letters = Vec::new();
    while ordinal > 0 {
        ordinal -= 1;
        letters.push((b'a' + (ordinal % 26) as u8) as char);
        ordinal /= 26;
    }
    letters.iter().rev().collect()
}

fn to_roman(ordinal: usize) -> String {
    if ordinal == 0 {
        return "0".to_string();
    }
    const NUMERALS: [(usize, &str); 13] = [
        (1000, "M"),
        (900, "CM"),
        (500, "D"),
        (400, "CD"),
        (100, "C"),
        (90, "XC"),
        (50, "L"),
        (40, "XL"),
        (10, "X"),
        (9, "IX"),
        (5, "V"),
        (4, "IV"),
        (1, "I"),
    ];
    let mut remaining = ordinal;
    let mut out = String::new();
    for (value, numeral) in NUMERALS {
        while remaining >= value {
            out.push_str(numeral);
            remaining -= value;
        }
    }
    out
}

/// First ordinal of an enumerated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Start {
    Number(usize),
    /// Keep counting from the document's running enumeration counter.
    Continue,
}

impl Default for Start {
    fn default() -> Self {
        Start::Number(1)
    }
}

/// Snapshot of one parsed bibliography file.
///
/// The default value represents a file that was never parsed: its
/// modification time is older than any real timestamp, so the first
/// comparison always triggers a parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BibfileCache {
    /// Modification time at the last successful parse. `None` means the
    /// file was never parsed.
    pub modification_time: Option<SystemTime>,
    /// Parsed entries, replaced wholesale on re-parse.
    pub data: BibliographyData,
}

impl BibfileCache {
    pub fn new(modification_time: SystemTime, data: BibliographyData) -> Self {
        BibfileCache {
            modification_time: Some(modification_time),
            data,
        }
    }

    /// Whether the snapshot must be re-parsed given the file's current
    /// modification time.
    pub fn is_stale(&self, mtime: SystemTime) -> bool {
        match self.modification_time {
            None => true,
            Some(cached) => cached < mtime,
        }
    }
}

/// Configuration and resolved state of one bibliography directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BibliographyCache {
    /// Bibliography file names (relative to the project root) this
    /// directive draws from, in directive order.
    pub bibliography_files: Vec<String>,
    /// Label style name ("unsrt" or "alpha").
    pub style: String,
    pub list_type: ListType,
    /// Only meaningful when `list_type` is `Enumerated`.
    pub enum_type: EnumType,
    /// Only meaningful when `list_type` is `Enumerated`.
    pub start: Start,
    /// Citation key to finally assigned display label, in render order.
    pub labels: IndexMap<String, String>,
    /// Prefix prepended to generated labels so multiple directives do not
    /// collide on the label namespace.
    pub label_prefix: String,
    /// Parsed entry filter, evaluated lazily at render time.
    pub filter: Option<FilterExpr>,
    /// Source encoding hint, passed through to the file loader.
    pub encoding: Option<String>,
    /// Whether rendering strips `{`/`}` from field values.
    pub curly_bracket_strip: bool,
}

impl Default for BibliographyCache {
    fn default() -> Self {
        BibliographyCache {
            bibliography_files: Vec::new(),
            style: "unsrt".to_string(),
            list_type: ListType::default(),
            enum_type: EnumType::default(),
            start: Start::default(),
            labels: IndexMap::new(),
            label_prefix: String::new(),
            filter: None,
            encoding: None,
            curly_bracket_strip: true,
        }
    }
}

/// Per-build registry of bibliography state, persisted across incremental
/// builds.
///
/// Directive and bibliography-file maps preserve insertion order, which
/// makes registration order observable: global iteration and the label
/// lookup tie-break below depend on it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Cache {
    schema_version: u32,
    /// Bibliography file name to snapshot. Keyed by file, not by document:
    /// a bibliography file may be shared across documents, so these
    /// snapshots survive document purges.
    bibliography_files: IndexMap<String, BibfileCache>,
    /// Document name to directive id to directive state.
    bibliography_directives: IndexMap<String, IndexMap<String, BibliographyCache>>,
    /// Document name to the set of keys cited in it, in first-cited order.
    cited_keys: IndexMap<String, IndexSet<String>>,
    /// Document name to the next ordinal for enumerated citation lists.
    enumeration_counters: IndexMap<String, usize>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// Version of the on-disk format. Bumped on any incompatible change to
    /// the serialized layout.
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new() -> Self {
        Cache {
            schema_version: Self::SCHEMA_VERSION,
            bibliography_files: IndexMap::new(),
            bibliography_directives: IndexMap::new(),
            cited_keys: IndexMap::new(),
            enumeration_counters: IndexMap::new(),
        }
    }

    // -----------------------------------------------------------------
    // Document invalidation
    // -----------------------------------------------------------------

    /// Removes all state recorded for `docname`: its bibliography
    /// directives, cited keys, and enumeration counter.
    ///
    /// Idempotent; purging an unknown document is a no-op. Bibliography
    /// file snapshots are left alone — they are keyed by file and are
    /// invalidated by modification time instead.
    pub fn purge(&mut self, docname: &str) {
        self.bibliography_directives.shift_remove(docname);
        self.cited_keys.shift_remove(docname);
        self.enumeration_counters.shift_remove(docname);
    }

    // -----------------------------------------------------------------
    // Bibliography file snapshots
    // -----------------------------------------------------------------

    pub fn bibfile(&self, name: &str) -> Option<&BibfileCache> {
        self.bibliography_files.get(name)
    }

    /// Replaces the snapshot for a bibliography file.
    pub fn set_bibfile(&mut self, name: &str, bibfile: BibfileCache) {
        self.bibliography_files.insert(name.to_string(), bibfile);
    }

    // -----------------------------------------------------------------
    // Enumeration counters
    // -----------------------------------------------------------------

    /// Sets the enumeration counter for `docname` to `value`. This is the
    /// explicit initialization required before the first read.
    pub fn set_enumeration_counter(&mut self, docname: &str, value: usize) {
        self.enumeration_counters.insert(docname.to_string(), value);
    }

    /// Returns the enumeration counter for `docname`.
    ///
    /// # Errors
    ///
    /// `CacheError::CounterNotInitialized` if the counter was never set for
    /// this document.
    pub fn get_enumeration_counter(&self, docname: &str) -> Result<usize, CacheError> {
        self.enumeration_counters
            .get(docname)
            .copied()
            .ok_or_else(|| CacheError::CounterNotInitialized {
                docname: docname.to_string(),
            })
    }

    /// Increments the enumeration counter for `docname`.
    ///
    /// # Errors
    ///
    /// `CacheError::CounterNotInitialized` if the counter was never set for
    /// this document.
    pub fn increment_enumeration_counter(&mut self, docname: &str) -> Result<(), CacheError> {
        match self.enumeration_counters.get_mut(docname) {
            Some(value) => {
                *value += 1;
                Ok(())
            }
            None => Err(CacheError::CounterNotInitialized {
                docname: docname.to_string(),
            }),
        }
    }

    // -----------------------------------------------------------------
    // Citation tracking
    // -----------------------------------------------------------------

    /// Records that `key` is cited in `docname`. Idempotent: the cited set
    /// is a set, repeated additions have no further effect.
    pub fn add_cited(&mut self, key: &str, docname: &str) {
        self.cited_keys
            .entry(docname.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Whether `key` is cited in any tracked document.
    pub fn is_cited(&self, key: &str) -> bool {
        self.cited_keys.values().any(|keys| keys.contains(key))
    }

    /// All cited keys, grouped by document in ascending lexicographic
    /// document order, and within a document in first-cited order.
    ///
    /// This ordering is load-bearing: label assignment relies on it to
    /// produce the same ordinals regardless of document processing order.
    /// A key cited in several documents is yielded once per document.
    pub fn get_all_cited_keys(&self) -> impl Iterator<Item = &str> {
        let mut docs: Vec<(&String, &IndexSet<String>)> = self.cited_keys.iter().collect();
        docs.sort_by(|a, b| a.0.cmp(b.0));
        docs.into_iter()
            .flat_map(|(_, keys)| keys.iter().map(String::as_str))
    }

    /// Documents citing `key`, in ascending lexicographic order.
    pub fn citing_documents(&self, key: &str) -> Vec<&str> {
        let mut docs: Vec<&str> = self
            .cited_keys
            .iter()
            .filter(|(_, keys)| keys.contains(key))
            .map(|(docname, _)| docname.as_str())
            .collect();
        docs.sort_unstable();
        docs
    }

    // -----------------------------------------------------------------
    // Bibliography directive registry
    // -----------------------------------------------------------------

    /// Registers directive state under `(docname, id)`.
    ///
    /// # Errors
    ///
    /// `CacheError::DuplicateDirective` if the id is already registered for
    /// this document. The failed registration does not replace the
    /// existing entry; directive ids are unique per document by
    /// construction of the caller.
    pub fn register_bibliography(
        &mut self,
        docname: &str,
        id: &str,
        bibcache: BibliographyCache,
    ) -> Result<(), CacheError> {
        let directives = self
            .bibliography_directives
            .entry(docname.to_string())
            .or_default();
        if directives.contains_key(id) {
            return Err(CacheError::DuplicateDirective {
                docname: docname.to_string(),
                id: id.to_string(),
            });
        }
        directives.insert(id.to_string(), bibcache);
        Ok(())
    }

    /// Returns the directive state registered under `(docname, id)`.
    ///
    /// # Errors
    ///
    /// `CacheError::DirectiveNotFound` if nothing was registered; callers
    /// must register before querying.
    pub fn get_bibliography(&self, docname: &str, id: &str) -> Result<&BibliographyCache, CacheError> {
        self.bibliography_directives
            .get(docname)
            .and_then(|directives| directives.get(id))
            .ok_or_else(|| CacheError::DirectiveNotFound {
                docname: docname.to_string(),
                id: id.to_string(),
            })
    }

    /// Mutable variant of [`get_bibliography`](Self::get_bibliography),
    /// used by label assignment.
    pub fn get_bibliography_mut(
        &mut self,
        docname: &str,
        id: &str,
    ) -> Result<&mut BibliographyCache, CacheError> {
        self.bibliography_directives
            .get_mut(docname)
            .and_then(|directives| directives.get_mut(id))
            .ok_or_else(|| CacheError::DirectiveNotFound {
                docname: docname.to_string(),
                id: id.to_string(),
            })
    }

    /// All registered directive state, grouped document-then-directive, in
    /// registration order.
    pub fn get_all_bibliographies(&self) -> impl Iterator<Item = &BibliographyCache> {
        self.bibliography_directives
            .values()
            .flat_map(|directives| directives.values())
    }

    /// Like [`get_all_bibliographies`](Self::get_all_bibliographies) but
    /// with the owning document and directive id.
    pub fn iter_directives(&self) -> impl Iterator<Item = (&str, &str, &BibliographyCache)> {
        self.bibliography_directives.iter().flat_map(|(docname, directives)| {
            directives
                .iter()
                .map(move |(id, bibcache)| (docname.as_str(), id.as_str(), bibcache))
        })
    }

    // -----------------------------------------------------------------
    // Label lookup
    // -----------------------------------------------------------------

    /// Returns the label assigned to `key` by scanning all registered
    /// directives.
    ///
    /// When several directives have labeled the same key, the
    /// first-registered directive wins — registration order is preserved
    /// by the underlying maps, so the result is deterministic.
    ///
    /// # Errors
    ///
    /// `CacheError::LabelNotFound` if no directive has a label for `key`.
    pub fn get_label_for_key(&self, key: &str) -> Result<&str, CacheError> {
        self.get_all_bibliographies()
            .find_map(|bibcache| bibcache.labels.get(key))
            .map(String::as_str)
            .ok_or_else(|| CacheError::LabelNotFound {
                key: key.to_string(),
            })
    }

    // -----------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------

    /// Loads a cache previously written by [`save`](Self::save).
    ///
    /// # Errors
    ///
    /// `CacheError::SchemaMismatch` if the file was written by a different
    /// schema version; I/O and JSON errors otherwise.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let content = fs::read_to_string(path)?;
        let cache: Cache = serde_json::from_str(&content)?;
        if cache.schema_version != Self::SCHEMA_VERSION {
            return Err(CacheError::SchemaMismatch {
                found: cache.schema_version,
                expected: Self::SCHEMA_VERSION,
            });
        }
        Ok(cache)
    }

    /// Writes the cache to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let content = serde_json::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
