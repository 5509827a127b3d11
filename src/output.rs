//! Output generation for resolved citations and bibliographies.
//!
//! This module renders bibliography directives as Markdown lists and
//! splices replacements (citation labels, rendered lists) back into the
//! original document text.

use crate::bibfile::Entry;
use crate::cache::{Cache, CacheError, ListType};
use crate::processor::ResolvedCitation;

/// A rendered bibliography directive, ready to replace its source block.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBibliography {
    /// The span of the directive block in the original text.
    pub span: (usize, usize),
    /// The rendered Markdown list.
    pub content: String,
}

/// Renders one bibliography directive as a Markdown list.
///
/// Entries appear in label-assignment order. With `backrefs`, each entry
/// is followed by the documents citing it.
///
/// # Errors
///
/// Fails if `(docname, id)` was never registered.
pub fn render_bibliography(
    cache: &Cache,
    docname: &str,
    id: &str,
    backrefs: bool,
) -> Result<String, CacheError> {
    let bibcache = cache.get_bibliography(docname, id)?;

    let mut lines = Vec::new();
    for (key, label) in &bibcache.labels {
        let entry = match find_entry(cache, &bibcache.bibliography_files, key) {
            Some(entry) => entry,
            None => continue,
        };
        let mut text = format_entry(key, entry, bibcache.curly_bracket_strip);
        if backrefs {
            let docs = cache.citing_documents(key);
            if !docs.is_empty() {
                text.push_str(" (cited in ");
                text.push_str(&docs.join(", "));
                text.push(')');
            }
        }
        lines.push(match bibcache.list_type {
            ListType::Bullet => format!("- {}", text),
            ListType::Enumerated => format!("{}. {}", label, text),
            ListType::Citation => format!("[{}] {}", label, text),
        });
    }

    Ok(lines.join("\n"))
}

/// First entry for `key` across the directive's bibliography files, in
/// file order.
fn find_entry<'a>(cache: &'a Cache, files: &[String], key: &str) -> Option<&'a Entry> {
    files
        .iter()
        .filter_map(|file| cache.bibfile(file))
        .find_map(|snapshot| snapshot.data.get(key))
}

/// Formats one entry as "Author. *Title*. Year.", falling back to the
/// citation key for entries with none of those fields.
fn format_entry(key: &str, entry: &Entry, curly_bracket_strip: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(author) = entry.fields.get("author") {
        parts.push(author.clone());
    }
    if let Some(title) = entry.fields.get("title") {
        parts.push(format!("*{}*", title));
    }
    if let Some(year) = entry.fields.get("year") {
        parts.push(year.clone());
    }

    let mut text = if parts.is_empty() {
        key.to_string()
    } else {
        let mut joined = parts.join(". ");
        joined.push('.');
        joined
    };
    if curly_bracket_strip {
        text = text.replace(['{', '}'], "");
    }
    text
}

/// Generates the final document: citation markers replaced by their
/// labels, directive blocks replaced by their rendered lists.
///
/// # Implementation Note
///
/// Replacements are performed from the end of the text towards the
/// beginning to preserve the validity of span indices. This ensures that
/// replacing earlier spans doesn't invalidate the spans of later ones.
pub fn generate_output(
    markdown: &str,
    citations: &[ResolvedCitation],
    bibliographies: &[RenderedBibliography],
) -> String {
    let mut replacements: Vec<(&(usize, usize), &str)> = citations
        .iter()
        .map(|c| (&c.original_span, c.formatted.as_str()))
        .chain(bibliographies.iter().map(|b| (&b.span, b.content.as_str())))
        .collect();
    replacements.sort_by(|a, b| b.0 .0.cmp(&a.0 .0));

    let mut result = markdown.to_string();
    for (&(start, end), text) in replacements {
        result.replace_range(start..end, text);
    }
    result
}
