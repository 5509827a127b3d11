//! bibtex-tools: CLI for resolving BibTeX citations and bibliographies in
//! Markdown documents.
//!
//! This library provides functionality to:
//! - Parse citation syntax and bibliography directives from Markdown
//! - Load BibTeX files into a persisted, incrementally refreshed cache
//! - Assign citation labels deterministically across a document project
//! - Generate output with resolved citations and rendered reference lists

pub mod bibfile;
pub mod cache;
pub mod filter;
pub mod markdown;
pub mod output;
pub mod processor;

pub use bibfile::{parse_bibfile, update_bibfile, BibliographyData, Entry};
pub use cache::{BibfileCache, BibliographyCache, Cache, CacheError};
pub use filter::{parse_filter, FilterExpr};
pub use markdown::{extract_citations, extract_directives, BibliographyDirective, Citation};
pub use output::{generate_output, render_bibliography, RenderedBibliography};
pub use processor::{
    assign_labels, process_document, resolve_citations, ResolvedCitation, Warning,
};
