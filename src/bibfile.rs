//! Bibliography file loading.
//!
//! Handles parsing `.bib` files (delegated to the `biblatex` crate) and
//! deciding, by modification time, whether a cached snapshot is still
//! current. Parsed entries are flattened to plain strings before they are
//! stored, so the build cache stays serializable.

use std::fs;
use std::path::Path;

use biblatex::ChunksExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{BibfileCache, Cache};

/// Errors that can occur when loading a bibliography file.
#[derive(Error, Debug)]
pub enum BibfileError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid bibliography data: {0}")]
    ParseError(String),
}

/// A single bibliography entry, reduced to plain data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry type (e.g., "article", "book"), lowercased.
    pub entry_type: String,
    /// Field name to field value, with brace markup resolved.
    pub fields: IndexMap<String, String>,
}

/// Parsed entries of one bibliography file, in file order, keyed by
/// citation key.
pub type BibliographyData = IndexMap<String, Entry>;

/// Parses BibTeX source into plain entry records.
///
/// # Errors
///
/// Returns `BibfileError::ParseError` if the source is not valid BibTeX.
pub fn parse_bibfile(source: &str) -> Result<BibliographyData, BibfileError> {
    let bibliography = biblatex::Bibliography::parse(source)
        .map_err(|e| BibfileError::ParseError(e.to_string()))?;

    let mut data = BibliographyData::new();
    for entry in bibliography.iter() {
        let mut fields = IndexMap::new();
        for (name, chunks) in &entry.fields {
            fields.insert(name.clone(), chunks.format_verbatim());
        }
        data.insert(
            entry.key.clone(),
            Entry {
                entry_type: entry.entry_type.to_string(),
                fields,
            },
        );
    }
    Ok(data)
}

/// Refreshes the cached snapshot of one bibliography file if needed.
///
/// Stats the file under `project_root`, compares its modification time
/// against the cached snapshot, and re-parses only when the file is newer
/// than the cache (or was never parsed). The snapshot is replaced
/// wholesale, never patched.
///
/// # Arguments
///
/// * `cache` - The build cache holding bibliography file snapshots
/// * `project_root` - Directory that bibliography file names are relative to
/// * `name` - The bibliography file name as written in the directive
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn update_bibfile(
    cache: &mut Cache,
    project_root: &Path,
    name: &str,
) -> Result<(), BibfileError> {
    let path = project_root.join(name);
    let mtime = fs::metadata(&path)?.modified()?;

    if let Some(cached) = cache.bibfile(name) {
        if !cached.is_stale(mtime) {
            return Ok(());
        }
    }

    let bytes = fs::read(&path)?;
    let source = String::from_utf8_lossy(&bytes);
    let data = parse_bibfile(&source)?;
    cache.set_bibfile(name, BibfileCache::new(mtime, data));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_BIB: &str = r#"
@article{smith19,
    author = {Smith, John},
    title = {A Study of Things},
    journal = {Journal of Things},
    year = {2019},
}

@book{jones20,
    author = {Jones, Mary},
    title = {The {Big} Book},
    year = {2020},
}
"#;

    #[test]
    fn test_parse_bibfile_entries_in_file_order() {
        // Given: BibTeX source with two entries
        // When: we parse it
        let data = parse_bibfile(SAMPLE_BIB).unwrap();

        // Then: both entries are present, in file order
        let keys: Vec<&String> = data.keys().collect();
        assert_eq!(keys, ["smith19", "jones20"]);
    }

    #[test]
    fn test_parse_bibfile_entry_fields() {
        let data = parse_bibfile(SAMPLE_BIB).unwrap();

        let entry = &data["smith19"];
        assert_eq!(entry.entry_type, "article");
        assert_eq!(entry.fields["author"], "Smith, John");
        assert_eq!(entry.fields["year"], "2019");
    }

    #[test]
    fn test_parse_bibfile_empty_source() {
        let data = parse_bibfile("").unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_update_bibfile_populates_cache() {
        // Given: a .bib file on disk and an empty cache
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("refs.bib"), SAMPLE_BIB).unwrap();
        let mut cache = Cache::new();

        // When: we update the snapshot
        update_bibfile(&mut cache, dir.path(), "refs.bib").unwrap();

        // Then: the cache holds the parsed entries and a real mtime
        let snapshot = cache.bibfile("refs.bib").unwrap();
        assert!(snapshot.modification_time.is_some());
        assert_eq!(snapshot.data.len(), 2);
    }

    #[test]
    fn test_update_bibfile_skips_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("refs.bib"), SAMPLE_BIB).unwrap();
        let mut cache = Cache::new();
        update_bibfile(&mut cache, dir.path(), "refs.bib").unwrap();
        let first_mtime = cache.bibfile("refs.bib").unwrap().modification_time;

        // When: we update again without touching the file
        update_bibfile(&mut cache, dir.path(), "refs.bib").unwrap();

        // Then: the snapshot is unchanged
        assert_eq!(
            cache.bibfile("refs.bib").unwrap().modification_time,
            first_mtime
        );
    }

    #[test]
    fn test_update_bibfile_reparses_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.bib");
        fs::write(&path, SAMPLE_BIB).unwrap();
        let mut cache = Cache::new();
        update_bibfile(&mut cache, dir.path(), "refs.bib").unwrap();

        // Force the cached snapshot to look old, then rewrite the file
        let stale = BibfileCache::default();
        cache.set_bibfile("refs.bib", stale);
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "@misc{{only,\n  title = {{Only Entry}},\n}}\n").unwrap();

        // When: we update again
        update_bibfile(&mut cache, dir.path(), "refs.bib").unwrap();

        // Then: the snapshot was replaced wholesale
        let snapshot = cache.bibfile("refs.bib").unwrap();
        assert_eq!(snapshot.data.len(), 1);
        assert!(snapshot.data.contains_key("only"));
    }

    #[test]
    fn test_update_bibfile_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::new();

        let result = update_bibfile(&mut cache, dir.path(), "nonexistent.bib");

        assert!(matches!(result, Err(BibfileError::IoError(_))));
    }

    #[test]
    fn test_parse_bibfile_invalid_source() {
        let result = parse_bibfile("@article{broken");
        assert!(matches!(result, Err(BibfileError::ParseError(_))));
    }
}
