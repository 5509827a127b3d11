//! CLI for bibtex-tools - Resolve BibTeX citations and bibliographies in
//! Markdown documents.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use bibtex_tools::processor::ProcessorError;
use bibtex_tools::{
    assign_labels, extract_directives, generate_output, process_document, render_bibliography,
    resolve_citations, update_bibfile, Cache, CacheError, RenderedBibliography,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Resolve BibTeX citations and bibliographies in Markdown documents
#[derive(Parser)]
#[command(name = "bibtex-tools")]
#[command(version)]
#[command(after_help = "\
Examples:
  bibtex-tools build docs/*.md --root docs
  bibtex-tools build intro.md chapter1.md --out-dir build/
  bibtex-tools keys
  bibtex-tools purge intro.md")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process Markdown documents, resolving citations and bibliographies
    #[command(after_help = "\
Examples:
  bibtex-tools build paper.md --root .
  bibtex-tools build docs/*.md --root docs --out-dir build/

Citation syntax: [@key]
Bibliography directive: a fenced ```{bibliography} refs.bib block")]
    Build {
        /// Input Markdown files
        #[arg(required = true)]
        docs: Vec<PathBuf>,

        /// Project root that bibliography file names are relative to
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Build cache file, kept between incremental runs
        #[arg(long, default_value = ".bibtex-cache.json")]
        cache: PathBuf,

        /// Output directory (default: stdout)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Don't append "cited in" back-references to entries
        #[arg(long)]
        no_backrefs: bool,
    },

    /// Print every cited key in global citation order
    Keys {
        /// Build cache file
        #[arg(long, default_value = ".bibtex-cache.json")]
        cache: PathBuf,
    },

    /// Drop all cached state for one document
    Purge {
        /// Document name as recorded by 'build'
        doc: String,

        /// Build cache file
        #[arg(long, default_value = ".bibtex-cache.json")]
        cache: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// AppError — semantic exit codes
// ---------------------------------------------------------------------------

enum AppError {
    /// Exit 10 — input document not found / unreadable
    InputFile(String),
    /// Exit 11 — bibliography file not found / invalid
    BibFile(String),
    /// Exit 12 — malformed directive or filter in a document
    Document(String),
    /// Exit 13 — cache file unreadable / unwritable
    CacheFile(String),
    /// Exit 14 — cannot write output file
    OutputFile(String),
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::InputFile(_) => 10,
            AppError::BibFile(_) => 11,
            AppError::Document(_) => 12,
            AppError::CacheFile(_) => 13,
            AppError::OutputFile(_) => 14,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InputFile(msg) => {
                write!(f, "{}\n  hint: verify the file path is correct", msg)
            }
            AppError::BibFile(msg) => {
                write!(
                    f,
                    "{}\n  hint: bibliography files are resolved relative to --root",
                    msg
                )
            }
            AppError::Document(msg) => {
                write!(f, "{}", msg)
            }
            AppError::CacheFile(msg) => {
                write!(
                    f,
                    "{}\n  hint: delete the cache file to start from a clean build",
                    msg
                )
            }
            AppError::OutputFile(msg) => {
                write!(
                    f,
                    "{}\n  hint: check that the output directory exists and is writable",
                    msg
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run() -> Result<(), AppError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            docs,
            root,
            cache,
            out_dir,
            no_backrefs,
        } => {
            build_command(&docs, &root, &cache, out_dir.as_deref(), no_backrefs)?;
        }
        Commands::Keys { cache } => {
            keys_command(&cache)?;
        }
        Commands::Purge { doc, cache } => {
            purge_command(&doc, &cache)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Process Markdown documents against the persisted build cache.
fn build_command(
    docs: &[PathBuf],
    root: &Path,
    cache_path: &Path,
    out_dir: Option<&Path>,
    no_backrefs: bool,
) -> Result<(), AppError> {
    // 1. Load the cache from the previous run, if compatible
    let mut cache = load_or_fresh_cache(cache_path)?;

    // 2. Read and process each document (purge + re-register)
    let mut sources: Vec<(String, String, PathBuf)> = Vec::new();
    for doc in docs {
        let markdown = fs::read_to_string(doc)
            .map_err(|e| AppError::InputFile(format!("'{}': {}", doc.display(), e)))?;
        let docname = doc.to_string_lossy().to_string();
        process_document(&mut cache, &docname, &markdown).map_err(map_processor_error)?;
        sources.push((docname, markdown, doc.clone()));
    }

    // 3. Refresh bibliography file snapshots referenced by any directive
    let bibfiles: BTreeSet<String> = cache
        .get_all_bibliographies()
        .flat_map(|bibcache| bibcache.bibliography_files.iter().cloned())
        .collect();
    for name in &bibfiles {
        update_bibfile(&mut cache, root, name)
            .map_err(|e| AppError::BibFile(format!("'{}': {}", name, e)))?;
    }

    // 4. Assign labels globally
    let mut warnings = assign_labels(&mut cache).map_err(map_processor_error)?;

    // 5. Render each document
    for (docname, markdown, path) in &sources {
        let (resolved, mut citation_warnings) = resolve_citations(&cache, markdown);
        warnings.append(&mut citation_warnings);

        let directives = extract_directives(markdown)
            .map_err(|e| AppError::Document(format!("'{}': {}", docname, e)))?;
        let mut rendered = Vec::with_capacity(directives.len());
        for (index, directive) in directives.iter().enumerate() {
            let id = format!("bibtex-bibliography-{}", index);
            let content = render_bibliography(&cache, docname, &id, !no_backrefs)
                .map_err(|e| AppError::Document(format!("'{}': {}", docname, e)))?;
            rendered.push(RenderedBibliography {
                span: directive.span,
                content,
            });
        }
        let output = generate_output(markdown, &resolved, &rendered);

        // 6. Write to file or stdout
        if let Some(out_dir) = out_dir {
            let file_name = path
                .file_name()
                .ok_or_else(|| AppError::InputFile(format!("'{}': not a file", path.display())))?;
            let out_path = out_dir.join(file_name);
            fs::write(&out_path, &output).map_err(|e| {
                AppError::OutputFile(format!("'{}': {}", out_path.display(), e))
            })?;
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            write!(handle, "{}", output)
                .map_err(|e| AppError::OutputFile(format!("stdout: {}", e)))?;
        }
    }

    // 7. Report warnings and persist the cache
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }
    cache
        .save(cache_path)
        .map_err(|e| AppError::CacheFile(format!("'{}': {}", cache_path.display(), e)))?;
    eprintln!(
        "processed {} document(s), {} warning(s)",
        sources.len(),
        warnings.len()
    );

    Ok(())
}

/// Print every cited key in global citation order.
fn keys_command(cache_path: &Path) -> Result<(), AppError> {
    let cache = Cache::load(cache_path)
        .map_err(|e| AppError::CacheFile(format!("'{}': {}", cache_path.display(), e)))?;
    for key in cache.get_all_cited_keys() {
        println!("{}", key);
    }
    Ok(())
}

/// Drop all cached state for one document.
fn purge_command(doc: &str, cache_path: &Path) -> Result<(), AppError> {
    let mut cache = Cache::load(cache_path)
        .map_err(|e| AppError::CacheFile(format!("'{}': {}", cache_path.display(), e)))?;
    cache.purge(doc);
    cache
        .save(cache_path)
        .map_err(|e| AppError::CacheFile(format!("'{}': {}", cache_path.display(), e)))?;
    eprintln!("purged {}", doc);
    Ok(())
}

/// Loads the persisted cache; a missing file or an old schema version
/// starts a fresh build instead of failing.
fn load_or_fresh_cache(cache_path: &Path) -> Result<Cache, AppError> {
    if !cache_path.exists() {
        return Ok(Cache::new());
    }
    match Cache::load(cache_path) {
        Ok(cache) => Ok(cache),
        Err(CacheError::SchemaMismatch { found, expected }) => {
            eprintln!(
                "warning: cache file '{}' has schema version {} (expected {}), starting fresh",
                cache_path.display(),
                found,
                expected
            );
            Ok(Cache::new())
        }
        Err(e) => Err(AppError::CacheFile(format!(
            "'{}': {}",
            cache_path.display(),
            e
        ))),
    }
}

/// Maps a ProcessorError to an AppError using type-safe matching.
fn map_processor_error(e: ProcessorError) -> AppError {
    match e {
        ProcessorError::BibfileNotLoaded(_) => AppError::BibFile(e.to_string()),
        _ => AppError::Document(e.to_string()),
    }
}
