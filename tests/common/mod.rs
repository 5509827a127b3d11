//! Shared test constants and helpers for integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use bibtex_tools::{assign_labels, process_document, update_bibfile, Cache, Warning};

/// A small BibTeX file with three entries, used across the test suite.
pub const SAMPLE_BIB: &str = r#"
@article{smith19,
    author = {Smith, John},
    title = {A Study of Things},
    journal = {Journal of Things},
    year = {2019},
}

@book{jones20,
    author = {Jones, Mary},
    title = {The Book of Examples},
    year = {2020},
}

@misc{brown21,
    author = {Brown, Ann},
    title = {Assorted Notes},
    year = {2021},
}
"#;

/// Writes `SAMPLE_BIB` as `refs.bib` into `root`.
pub fn write_sample_bib(root: &Path) -> PathBuf {
    let path = root.join("refs.bib");
    fs::write(&path, SAMPLE_BIB).unwrap();
    path
}

/// Runs the full library pipeline for a set of `(docname, markdown)`
/// documents against bibliography files under `root`.
///
/// Returns the populated cache and all warnings, after label assignment.
pub fn build_documents(root: &Path, docs: &[(&str, &str)]) -> (Cache, Vec<Warning>) {
    let mut cache = Cache::new();
    for (docname, markdown) in docs {
        process_document(&mut cache, docname, markdown).unwrap();
    }
    let bibfiles: Vec<String> = cache
        .get_all_bibliographies()
        .flat_map(|bibcache| bibcache.bibliography_files.iter().cloned())
        .collect();
    for name in bibfiles {
        update_bibfile(&mut cache, root, &name).unwrap();
    }
    let warnings = assign_labels(&mut cache).unwrap();
    (cache, warnings)
}
