//! Citation and bibliography processing.
//!
//! This module drives the two build phases: per-document processing
//! (recording citations and bibliography directives into the cache) and
//! the global consolidation pass that assigns labels across documents.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

use crate::bibfile::Entry;
use crate::cache::{BibliographyCache, Cache, CacheError, ListType, Start};
use crate::filter::{parse_filter, EntryContext, FilterError};
use crate::markdown::{extract_citations, extract_directives, DirectiveError};

/// Errors that can occur during processing.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Directive(#[from] DirectiveError),

    #[error("invalid filter expression: {0}")]
    Filter(#[from] FilterError),

    /// A directive references a bibliography file whose snapshot was never
    /// loaded into the cache. Callers must refresh snapshots before label
    /// assignment.
    #[error("bibliography file '{0}' has not been loaded")]
    BibfileNotLoaded(String),
}

/// A non-fatal problem found during processing, reported to the user as a
/// build warning rather than aborting the build.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A citation key that no bibliography directive resolves.
    KeyNotFound { key: String },
    /// One display label ended up assigned to several distinct keys.
    DuplicateLabel { label: String, keys: Vec<String> },
    /// A filter expression failed to evaluate against an entry; the entry
    /// is excluded.
    FilterSkipped {
        docname: String,
        key: String,
        message: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::KeyNotFound { key } => {
                write!(f, "could not find bibtex key {}", key)
            }
            Warning::DuplicateLabel { label, keys } => {
                write!(f, "duplicate label {} for keys {}", label, keys.join(","))
            }
            Warning::FilterSkipped {
                docname,
                key,
                message,
            } => {
                write!(f, "filter skipped entry {} in {}: {}", key, docname, message)
            }
        }
    }
}

/// A citation reference with its final replacement text.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCitation {
    /// The span in the original text where the citation was found.
    pub original_span: (usize, usize),
    /// The replacement text (e.g., "[3]").
    pub formatted: String,
}

/// Records a document's citations and bibliography directives into the
/// cache.
///
/// The document's previous state is purged first, so re-processing a
/// changed document fully rebuilds its entries (stale-document
/// invalidation). Directives are registered under generated ids
/// `bibtex-bibliography-N` in order of appearance.
///
/// # Errors
///
/// Returns an error for a malformed directive block or filter expression.
pub fn process_document(
    cache: &mut Cache,
    docname: &str,
    markdown: &str,
) -> Result<(), ProcessorError> {
    cache.purge(docname);

    for citation in extract_citations(markdown) {
        cache.add_cited(&citation.key, docname);
    }

    for (index, directive) in extract_directives(markdown)?.into_iter().enumerate() {
        let id = format!("bibtex-bibliography-{}", index);
        let filter = directive.filter.as_deref().map(parse_filter).transpose()?;
        let bibcache = BibliographyCache {
            bibliography_files: directive.bibliography_files,
            style: directive.style.unwrap_or_else(|| "unsrt".to_string()),
            list_type: directive.list_type,
            enum_type: directive.enum_type,
            start: directive.start,
            labels: IndexMap::new(),
            label_prefix: directive.label_prefix,
            filter,
            encoding: directive.encoding,
            curly_bracket_strip: directive.curly_bracket_strip,
        };
        cache.register_bibliography(docname, &id, bibcache)?;
    }

    Ok(())
}

/// Assigns display labels to every registered bibliography directive.
///
/// Entries are selected per directive (its filter, or "cited" by default),
/// ordered by the global citation order for the "unsrt" style or
/// alphabetically by label for "alpha", and labeled. Enumerated lists draw
/// their ordinals from the document's enumeration counter, which keeps
/// counting across multiple lists in one document.
///
/// Returns build warnings: duplicate labels and filter evaluation skips.
///
/// # Errors
///
/// Returns `ProcessorError::BibfileNotLoaded` if a directive references a
/// bibliography file with no cached snapshot.
pub fn assign_labels(cache: &mut Cache) -> Result<Vec<Warning>, ProcessorError> {
    // Global citation order: documents alphabetical, keys in first-cited
    // order, first occurrence wins for keys cited in several documents.
    let citation_order: IndexSet<String> =
        cache.get_all_cited_keys().map(str::to_string).collect();

    let directive_ids: Vec<(String, String)> = cache
        .iter_directives()
        .map(|(docname, id, _)| (docname.to_string(), id.to_string()))
        .collect();

    let mut warnings = Vec::new();

    for (docname, id) in &directive_ids {
        let bibcache = cache.get_bibliography(docname, id)?.clone();
        let mut selected = select_entries(cache, docname, &bibcache, &mut warnings)?;

        let labels = if bibcache.style == "alpha" {
            let mut labeled: Vec<(String, String)> = selected
                .drain(..)
                .map(|(key, entry)| {
                    let label = format!("{}{}", bibcache.label_prefix, alpha_label(&key, &entry));
                    (key, label)
                })
                .collect();
            labeled.sort_by(|a, b| a.1.cmp(&b.1));
            labeled.into_iter().collect()
        } else {
            // unsrt: cited entries in global citation order, uncited ones
            // after them in bibliography file order (stable sort)
            selected.sort_by_key(|(key, _)| {
                citation_order.get_index_of(key).unwrap_or(usize::MAX)
            });
            number_entries(cache, docname, &bibcache, &selected)?
        };

        cache.get_bibliography_mut(docname, id)?.labels = labels;
    }

    warnings.extend(duplicate_label_warnings(cache));
    Ok(warnings)
}

/// Selects the entries a directive renders, deduplicated across its
/// bibliography files (first file wins).
fn select_entries(
    cache: &Cache,
    docname: &str,
    bibcache: &BibliographyCache,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<(String, Entry)>, ProcessorError> {
    let mut selected: Vec<(String, Entry)> = Vec::new();
    let mut seen: IndexSet<String> = IndexSet::new();

    for file in &bibcache.bibliography_files {
        let snapshot = cache
            .bibfile(file)
            .ok_or_else(|| ProcessorError::BibfileNotLoaded(file.clone()))?;
        for (key, entry) in &snapshot.data {
            if seen.contains(key) {
                continue;
            }
            let cited = cache.is_cited(key);
            let keep = match &bibcache.filter {
                Some(expr) => {
                    let ctx = EntryContext {
                        key,
                        entry,
                        docname,
                        cited,
                    };
                    match expr.eval(&ctx) {
                        Ok(keep) => keep,
                        Err(e) => {
                            warnings.push(Warning::FilterSkipped {
                                docname: docname.to_string(),
                                key: key.clone(),
                                message: e.to_string(),
                            });
                            false
                        }
                    }
                }
                // Default selection: only entries cited somewhere
                None => cited,
            };
            if keep {
                seen.insert(key.clone());
                selected.push((key.clone(), entry.clone()));
            }
        }
    }

    Ok(selected)
}

/// Assigns ordinal labels to the selected entries, in order.
///
/// Enumerated lists use the per-document enumeration counter so ordinals
/// continue across lists; other list types number locally from `start`.
fn number_entries(
    cache: &mut Cache,
    docname: &str,
    bibcache: &BibliographyCache,
    selected: &[(String, Entry)],
) -> Result<IndexMap<String, String>, ProcessorError> {
    let mut labels = IndexMap::new();

    if bibcache.list_type == ListType::Enumerated {
        match bibcache.start {
            Start::Number(value) => cache.set_enumeration_counter(docname, value),
            Start::Continue => {
                if cache.get_enumeration_counter(docname).is_err() {
                    cache.set_enumeration_counter(docname, 1);
                }
            }
        }
        for (key, _) in selected {
            let ordinal = cache.get_enumeration_counter(docname)?;
            labels.insert(
                key.clone(),
                format!("{}{}", bibcache.label_prefix, bibcache.enum_type.format(ordinal)),
            );
            cache.increment_enumeration_counter(docname)?;
        }
    } else {
        let mut ordinal = match bibcache.start {
            Start::Number(value) => value,
            Start::Continue => 1,
        };
        for (key, _) in selected {
            labels.insert(key.clone(), format!("{}{}", bibcache.label_prefix, ordinal));
            ordinal += 1;
        }
    }

    Ok(labels)
}

/// One label pointing at two distinct keys means upstream deduplication
/// failed; report every such label.
fn duplicate_label_warnings(cache: &Cache) -> Vec<Warning> {
    let mut by_label: IndexMap<&str, IndexSet<&str>> = IndexMap::new();
    for bibcache in cache.get_all_bibliographies() {
        for (key, label) in &bibcache.labels {
            by_label.entry(label).or_default().insert(key);
        }
    }

    by_label
        .into_iter()
        .filter(|(_, keys)| keys.len() > 1)
        .map(|(label, keys)| Warning::DuplicateLabel {
            label: label.to_string(),
            keys: keys.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

/// Derives an "alpha" style label from the first author and year, falling
/// back to the citation key.
fn alpha_label(key: &str, entry: &Entry) -> String {
    let name = entry
        .fields
        .get("author")
        .map(|author| {
            let first = author.split(" and ").next().unwrap_or(author);
            let family = first.split(',').next().unwrap_or(first).trim();
            family
                .chars()
                .filter(|c| c.is_alphanumeric())
                .take(3)
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| key.chars().take(3).collect());

    let year = entry
        .fields
        .get("year")
        .map(|year| {
            let digits: String = year.chars().filter(char::is_ascii_digit).collect();
            if digits.len() > 2 {
                digits[digits.len() - 2..].to_string()
            } else {
                digits
            }
        })
        .unwrap_or_default();

    format!("{}{}", name, year)
}

/// Resolves every citation in a document to its replacement text.
///
/// Keys no directive has labeled produce a `KeyNotFound` warning (once per
/// key) and are left for the caller to keep verbatim.
pub fn resolve_citations(
    cache: &Cache,
    markdown: &str,
) -> (Vec<ResolvedCitation>, Vec<Warning>) {
    let mut resolved = Vec::new();
    let mut warnings = Vec::new();
    let mut missing: IndexSet<String> = IndexSet::new();

    for citation in extract_citations(markdown) {
        match cache.get_label_for_key(&citation.key) {
            Ok(label) => resolved.push(ResolvedCitation {
                original_span: citation.span,
                formatted: format!("[{}]", label),
            }),
            Err(_) => {
                if missing.insert(citation.key.clone()) {
                    warnings.push(Warning::KeyNotFound { key: citation.key });
                }
            }
        }
    }

    (resolved, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BibfileCache;
    use std::time::SystemTime;

    fn entry(entry_type: &str, pairs: &[(&str, &str)]) -> Entry {
        Entry {
            entry_type: entry_type.to_string(),
            fields: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// Cache preloaded with a snapshot of "refs.bib" holding three entries.
    fn cache_with_refs() -> Cache {
        let mut data = crate::bibfile::BibliographyData::new();
        data.insert(
            "smith19".to_string(),
            entry(
                "article",
                &[("author", "Smith, John"), ("title", "A Study"), ("year", "2019")],
            ),
        );
        data.insert(
            "jones20".to_string(),
            entry(
                "book",
                &[("author", "Jones, Mary"), ("title", "The Book"), ("year", "2020")],
            ),
        );
        data.insert(
            "brown21".to_string(),
            entry(
                "misc",
                &[("author", "Brown, Ann"), ("title", "Notes"), ("year", "2021")],
            ),
        );
        let mut cache = Cache::new();
        cache.set_bibfile("refs.bib", BibfileCache::new(SystemTime::now(), data));
        cache
    }

    // --- process_document ---

    #[test]
    fn test_process_document_records_citations_and_directives() {
        // Given: a document citing two keys with one directive
        let mut cache = cache_with_refs();
        let markdown = "See [@smith19] and [@jones20].\n\n```{bibliography} refs.bib\n```\n";

        // When: we process it
        process_document(&mut cache, "doc1", markdown).unwrap();

        // Then: citations and the directive are registered
        assert!(cache.is_cited("smith19"));
        assert!(cache.is_cited("jones20"));
        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        assert_eq!(bibcache.bibliography_files, ["refs.bib"]);
        assert_eq!(bibcache.style, "unsrt");
    }

    #[test]
    fn test_process_document_purges_previous_state() {
        let mut cache = cache_with_refs();
        process_document(&mut cache, "doc1", "Old [@brown21].").unwrap();

        // When: the document is re-processed without that citation
        process_document(&mut cache, "doc1", "New [@smith19].").unwrap();

        // Then: only the new citation remains
        assert!(cache.is_cited("smith19"));
        assert!(!cache.is_cited("brown21"));
    }

    #[test]
    fn test_process_document_bad_filter_is_an_error() {
        let mut cache = cache_with_refs();
        let markdown = "```{bibliography} refs.bib\n:filter: type ==\n```\n";

        let result = process_document(&mut cache, "doc1", markdown);

        assert!(matches!(result, Err(ProcessorError::Filter(_))));
    }

    // --- assign_labels ---

    #[test]
    fn test_assign_labels_citation_order() {
        // Given: jones20 cited before smith19
        let mut cache = cache_with_refs();
        let markdown = "[@jones20] then [@smith19].\n\n```{bibliography} refs.bib\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();

        // When: labels are assigned
        let warnings = assign_labels(&mut cache).unwrap();

        // Then: ordinals follow citation order, uncited entries are omitted
        assert!(warnings.is_empty());
        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        let labels: Vec<(&String, &String)> = bibcache.labels.iter().collect();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0], (&"jones20".to_string(), &"1".to_string()));
        assert_eq!(labels[1], (&"smith19".to_string(), &"2".to_string()));
    }

    #[test]
    fn test_assign_labels_filter_true_includes_uncited() {
        let mut cache = cache_with_refs();
        let markdown = "```{bibliography} refs.bib\n:filter: true\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();

        assign_labels(&mut cache).unwrap();

        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        // Nothing is cited: all entries keep bibliography file order
        let keys: Vec<&String> = bibcache.labels.keys().collect();
        assert_eq!(keys, ["smith19", "jones20", "brown21"]);
    }

    #[test]
    fn test_assign_labels_enumeration_continues_across_lists() {
        // Given: two enumerated directives in one document
        let mut cache = cache_with_refs();
        let markdown = "\
[@smith19] [@jones20] [@brown21]

```{bibliography} refs.bib
:list: enumerated
:filter: key == \"smith19\" or key == \"jones20\"
```

```{bibliography} refs.bib
:list: enumerated
:start: continue
:filter: key == \"brown21\"
```
";
        process_document(&mut cache, "doc1", markdown).unwrap();

        // When: labels are assigned
        assign_labels(&mut cache).unwrap();

        // Then: the second list continues at 3
        let second = cache.get_bibliography("doc1", "bibtex-bibliography-1").unwrap();
        assert_eq!(second.labels["brown21"], "3");
        assert_eq!(cache.get_enumeration_counter("doc1").unwrap(), 4);
    }

    #[test]
    fn test_assign_labels_enumerated_start_resets_counter() {
        let mut cache = cache_with_refs();
        let markdown = "\
[@smith19]

```{bibliography} refs.bib
:list: enumerated
:start: 10
```
";
        process_document(&mut cache, "doc1", markdown).unwrap();
        assign_labels(&mut cache).unwrap();

        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        assert_eq!(bibcache.labels["smith19"], "10");
    }

    #[test]
    fn test_assign_labels_label_prefix() {
        let mut cache = cache_with_refs();
        let markdown = "[@smith19]\n\n```{bibliography} refs.bib\n:labelprefix: A\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();

        assign_labels(&mut cache).unwrap();

        assert_eq!(cache.get_label_for_key("smith19").unwrap(), "A1");
    }

    #[test]
    fn test_assign_labels_alpha_style() {
        let mut cache = cache_with_refs();
        let markdown = "[@smith19] [@jones20]\n\n```{bibliography} refs.bib\n:style: alpha\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();

        assign_labels(&mut cache).unwrap();

        assert_eq!(cache.get_label_for_key("smith19").unwrap(), "Smi19");
        assert_eq!(cache.get_label_for_key("jones20").unwrap(), "Jon20");
        // Alpha labels sort alphabetically in the rendered list
        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        let labels: Vec<&String> = bibcache.labels.values().collect();
        let mut sorted = labels.clone();
        sorted.sort();
        assert_eq!(labels, sorted);
    }

    #[test]
    fn test_assign_labels_duplicate_label_warning() {
        // Given: two documents whose citation lists both start at 1 with
        // different keys, producing the same "1" label twice
        let mut cache = cache_with_refs();
        process_document(
            &mut cache,
            "doc1",
            "[@smith19]\n\n```{bibliography} refs.bib\n:filter: key == \"smith19\"\n```\n",
        )
        .unwrap();
        process_document(
            &mut cache,
            "doc2",
            "[@jones20]\n\n```{bibliography} refs.bib\n:filter: key == \"jones20\"\n```\n",
        )
        .unwrap();

        // When: labels are assigned
        let warnings = assign_labels(&mut cache).unwrap();

        // Then: the clash is reported with both keys
        assert_eq!(warnings.len(), 1);
        match &warnings[0] {
            Warning::DuplicateLabel { label, keys } => {
                assert_eq!(label, "1");
                assert_eq!(keys.len(), 2);
                assert!(keys.contains(&"smith19".to_string()));
                assert!(keys.contains(&"jones20".to_string()));
            }
            other => panic!("expected DuplicateLabel, got {:?}", other),
        }
        assert_eq!(
            warnings[0].to_string(),
            "duplicate label 1 for keys smith19,jones20"
        );
    }

    #[test]
    fn test_assign_labels_shared_file_across_documents() {
        // Same key cited from two documents, one directive: no duplicate
        let mut cache = cache_with_refs();
        process_document(
            &mut cache,
            "doc1",
            "[@smith19]\n\n```{bibliography} refs.bib\n```\n",
        )
        .unwrap();
        process_document(&mut cache, "doc2", "[@smith19] again.").unwrap();

        let warnings = assign_labels(&mut cache).unwrap();

        assert!(warnings.is_empty());
        assert_eq!(cache.get_label_for_key("smith19").unwrap(), "1");
    }

    #[test]
    fn test_assign_labels_missing_bibfile_snapshot() {
        let mut cache = Cache::new();
        process_document(&mut cache, "doc1", "```{bibliography} missing.bib\n```\n").unwrap();

        let result = assign_labels(&mut cache);

        assert!(matches!(result, Err(ProcessorError::BibfileNotLoaded(_))));
    }

    #[test]
    fn test_assign_labels_filter_error_skips_entry() {
        let mut cache = cache_with_refs();
        // "volume" is not a field of any entry
        let markdown = "```{bibliography} refs.bib\n:filter: volume == \"1\"\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();

        let warnings = assign_labels(&mut cache).unwrap();

        assert_eq!(warnings.len(), 3);
        assert!(warnings
            .iter()
            .all(|w| matches!(w, Warning::FilterSkipped { .. })));
        let bibcache = cache.get_bibliography("doc1", "bibtex-bibliography-0").unwrap();
        assert!(bibcache.labels.is_empty());
    }

    // --- resolve_citations ---

    #[test]
    fn test_resolve_citations_known_and_unknown_keys() {
        // Given: one labeled key and one the bibliography cannot resolve
        let mut cache = cache_with_refs();
        let markdown = "[@smith19] and [@nosuchkey1].\n\n```{bibliography} refs.bib\n```\n";
        process_document(&mut cache, "doc1", markdown).unwrap();
        assign_labels(&mut cache).unwrap();

        // When: citations are resolved
        let (resolved, warnings) = resolve_citations(&cache, markdown);

        // Then: the known key resolves, the unknown one warns
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].formatted, "[1]");
        assert_eq!(
            warnings,
            vec![Warning::KeyNotFound {
                key: "nosuchkey1".to_string()
            }]
        );
        assert_eq!(
            warnings[0].to_string(),
            "could not find bibtex key nosuchkey1"
        );
    }

    #[test]
    fn test_resolve_citations_warns_once_per_key() {
        let cache = Cache::new();
        let markdown = "[@ghost] and [@ghost] again.";

        let (resolved, warnings) = resolve_citations(&cache, markdown);

        assert!(resolved.is_empty());
        assert_eq!(warnings.len(), 1);
    }
}
