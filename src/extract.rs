//! Token extraction: the extractor pipeline over in-memory source text and
//! the glob-based batch file front.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ExtractorFn;

/// Context handed to each configured extractor. `original` always carries the
/// untouched input; `code` may be a preprocessed view of it.
#[derive(Debug, Clone, Copy)]
pub struct ExtractorContext<'a> {
    pub original: &'a str,
    pub code: &'a str,
    pub id: Option<&'a str>,
}

/// The default extractor: splits source text on whitespace, quotes, braces
/// and semicolons, keeping everything else as a candidate token.
pub fn default_extractor() -> ExtractorFn {
    Arc::new(|ctx: &ExtractorContext<'_>| split_candidates(ctx.code))
}

pub fn split_candidates(code: &str) -> BTreeSet<String> {
    code.split(is_separator)
        .map(|tok| tok.trim_start_matches('\\'))
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_separator(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '\'' | '"' | '`' | ';' | '{' | '}')
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan requires at least one path or glob pattern")]
    NoPatterns,
    #[error("invalid glob pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanGlobOptions {
    pub base_path: PathBuf,
    pub respect_gitignore: bool,
    pub include_node_modules: bool,
    pub include_binary_files: bool,
    pub include_css_files: bool,
    pub include_lock_files: bool,
}

impl Default for ScanGlobOptions {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            respect_gitignore: true,
            include_node_modules: false,
            include_binary_files: false,
            include_css_files: false,
            include_lock_files: false,
        }
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet, ScanError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| ScanError::Pattern {
            pattern: pattern.clone(),
            source: err,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| ScanError::Pattern {
        pattern: patterns.join(","),
        source: err,
    })
}

/// Walks the filesystem under `options.base_path` and returns the files
/// matching `patterns` after the ignore filters. Candidate sources only:
/// stylesheets, binaries and lockfiles are skipped unless opted in.
pub fn scan_globs(
    patterns: &[String],
    ignore_patterns: &[String],
    options: &ScanGlobOptions,
) -> Result<Vec<PathBuf>, ScanError> {
    if patterns.is_empty() {
        return Err(ScanError::NoPatterns);
    }

    let globset = build_globset(patterns)?;
    let ignore_set = build_globset(ignore_patterns)?;
    let mut paths = Vec::new();
    let mut seen = HashSet::new();

    let mut builder = WalkBuilder::new(&options.base_path);
    builder
        .hidden(false)
        .git_ignore(options.respect_gitignore)
        .git_global(options.respect_gitignore)
        .git_exclude(options.respect_gitignore);

    for entry in builder.build() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(&options.base_path).unwrap_or(path);
        if !globset.is_match(relative) && !globset.is_match(path) {
            continue;
        }
        if ignore_set.is_match(relative) || ignore_set.is_match(path) {
            continue;
        }
        if should_skip_file(path, options) {
            continue;
        }
        if seen.insert(path.to_path_buf()) {
            paths.push(path.to_path_buf());
        }
    }

    paths.sort();
    Ok(paths)
}

fn should_skip_file(path: &Path, options: &ScanGlobOptions) -> bool {
    if !options.include_node_modules
        && path
            .components()
            .any(|component| component.as_os_str() == "node_modules")
    {
        return true;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    if !options.include_lock_files && is_lock_file(file_name) {
        return true;
    }

    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    if let Some(ext) = ext.as_deref() {
        if !options.include_css_files && is_stylesheet_extension(ext) {
            return true;
        }
        if !options.include_binary_files && is_binary_extension(ext) {
            return true;
        }
    }

    false
}

fn is_stylesheet_extension(ext: &str) -> bool {
    matches!(ext, "css" | "scss" | "sass" | "less" | "styl" | "pcss")
}

fn is_binary_extension(ext: &str) -> bool {
    const IMAGE: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "avif"];
    const MEDIA: &[&str] = &["mp4", "mov", "webm", "mp3", "wav", "ogg", "flac"];
    const ARCHIVE: &[&str] = &["zip", "gz", "tgz", "rar", "7z", "pdf"];
    const FONT: &[&str] = &["woff", "woff2", "ttf", "otf", "eot"];
    IMAGE.contains(&ext) || MEDIA.contains(&ext) || ARCHIVE.contains(&ext) || FONT.contains(&ext)
}

fn is_lock_file(file_name: &str) -> bool {
    matches!(
        file_name,
        "package-lock.json" | "pnpm-lock.yaml" | "yarn.lock" | "bun.lockb" | "Cargo.lock"
    )
}
