//! Markdown citation and directive parser.
//!
//! Extracts citations in the format `[@key]` and fenced bibliography
//! directive blocks of the form:
//!
//! ````text
//! ```{bibliography} refs.bib more.bib
//! :style: unsrt
//! :list: enumerated
//! :start: continue
//! ```
//! ````

use regex::Regex;
use thiserror::Error;

use crate::cache::{EnumType, ListType, Start};

/// Errors from parsing a bibliography directive block.
#[derive(Error, Debug, PartialEq)]
pub enum DirectiveError {
    #[error("bibliography directive has no bibliography files")]
    MissingFiles,

    #[error("unknown bibliography option ':{0}:'")]
    UnknownOption(String),

    #[error("invalid value '{value}' for bibliography option ':{option}:'")]
    InvalidValue { option: String, value: String },

    #[error("unexpected line in bibliography directive: '{0}'")]
    UnexpectedLine(String),

    #[error("unterminated bibliography directive")]
    Unterminated,
}

/// A citation reference found in the Markdown text.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    /// The citation key (e.g., "smith19").
    pub key: String,
    /// Start and end byte positions in the original text.
    pub span: (usize, usize),
}

/// A bibliography directive block found in the Markdown text, before any
/// cache state is attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct BibliographyDirective {
    pub bibliography_files: Vec<String>,
    pub style: Option<String>,
    pub list_type: ListType,
    pub enum_type: EnumType,
    pub start: Start,
    pub label_prefix: String,
    /// Raw filter source; parsed later so parse errors carry context.
    pub filter: Option<String>,
    pub encoding: Option<String>,
    pub curly_bracket_strip: bool,
    /// Byte span of the whole block, opening fence to closing fence.
    pub span: (usize, usize),
}

/// Extracts all citations from the given Markdown text.
///
/// # Examples
///
/// ```
/// use bibtex_tools::extract_citations;
///
/// let citations = extract_citations("See [@smith19] for details.");
/// assert_eq!(citations.len(), 1);
/// assert_eq!(citations[0].key, "smith19");
/// ```
pub fn extract_citations(markdown: &str) -> Vec<Citation> {
    // Citation key: anything up to the closing bracket, no whitespace
    let re = Regex::new(r"\[@([^\]\[\s]+)\]").expect("citation regex is valid");

    re.captures_iter(markdown)
        .map(|cap| {
            let full_match = cap.get(0).expect("group 0 always matches");
            let key = cap.get(1).expect("key group is mandatory");
            Citation {
                key: key.as_str().to_string(),
                span: (full_match.start(), full_match.end()),
            }
        })
        .collect()
}

/// Extracts all bibliography directive blocks from the given Markdown text.
///
/// # Errors
///
/// Returns a `DirectiveError` for a block with no bibliography files, an
/// unknown or malformed option, or a missing closing fence.
pub fn extract_directives(markdown: &str) -> Result<Vec<BibliographyDirective>, DirectiveError> {
    const OPEN: &str = "```{bibliography}";
    const FENCE: &str = "```";

    let mut directives = Vec::new();
    let mut lines = line_spans(markdown).into_iter();

    while let Some((start, line)) = lines.next() {
        let trimmed = line.trim_end();
        if !trimmed.starts_with(OPEN) {
            continue;
        }

        let files: Vec<String> = trimmed[OPEN.len()..]
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            return Err(DirectiveError::MissingFiles);
        }

        let mut directive = BibliographyDirective {
            bibliography_files: files,
            style: None,
            list_type: ListType::default(),
            enum_type: EnumType::default(),
            start: Start::default(),
            label_prefix: String::new(),
            filter: None,
            encoding: None,
            curly_bracket_strip: true,
            span: (start, start + trimmed.len()),
        };

        let mut terminated = false;
        for (line_start, line) in lines.by_ref() {
            let trimmed = line.trim_end();
            if trimmed == FENCE {
                directive.span.1 = line_start + trimmed.len();
                terminated = true;
                break;
            }
            if trimmed.is_empty() {
                continue;
            }
            parse_option(&mut directive, trimmed)?;
        }
        if !terminated {
            return Err(DirectiveError::Unterminated);
        }

        directives.push(directive);
    }

    Ok(directives)
}

/// Splits text into lines with their starting byte offsets, newline
/// included in the line slice.
fn line_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        spans.push((offset, line));
        offset += line.len();
    }
    spans
}

/// Parses one `:name: value` option line into the directive.
fn parse_option(directive: &mut BibliographyDirective, line: &str) -> Result<(), DirectiveError> {
    let rest = line
        .strip_prefix(':')
        .ok_or_else(|| DirectiveError::UnexpectedLine(line.to_string()))?;
    let (name, value) = rest
        .split_once(':')
        .ok_or_else(|| DirectiveError::UnexpectedLine(line.to_string()))?;
    let value = value.trim();

    let invalid = |option: &str, value: &str| DirectiveError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    };

    match name {
        "style" => directive.style = Some(value.to_string()),
        "labelprefix" => directive.label_prefix = value.to_string(),
        "filter" => directive.filter = Some(value.to_string()),
        "encoding" => directive.encoding = Some(value.to_string()),
        "no-curly-strip" => {
            if !value.is_empty() {
                return Err(invalid(name, value));
            }
            directive.curly_bracket_strip = false;
        }
        "list" => {
            directive.list_type = match value {
                "citation" => ListType::Citation,
                "bullet" => ListType::Bullet,
                "enumerated" => ListType::Enumerated,
                _ => return Err(invalid(name, value)),
            }
        }
        "enumtype" => {
            directive.enum_type = match value {
                "arabic" => EnumType::Arabic,
                "loweralpha" => EnumType::LowerAlpha,
                "upperalpha" => EnumType::UpperAlpha,
                "lowerroman" => EnumType::LowerRoman,
                "upperroman" => EnumType::UpperRoman,
                _ => return Err(invalid(name, value)),
            }
        }
        "start" => {
            directive.start = if value == "continue" {
                Start::Continue
            } else {
                let number = value.parse().map_err(|_| invalid(name, value))?;
                Start::Number(number)
            }
        }
        _ => return Err(DirectiveError::UnknownOption(name.to_string())),
    }

    Ok(())
}
