use crate::core::validator::ProductValidator;
use crate::io::product::{ProductReader, RasterProduct};
use crate::types::{PercentileError, PercentileResult};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

fn has_wildcard(segment: &str) -> bool {
    segment.contains('*') || segment.contains('?')
}

/// Translate the wildcard part of a path pattern into an anchored regular expression
fn wildcard_regex(pattern: &str) -> PercentileResult<Regex> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    regex.push_str("(?:.*/)?");
                } else {
                    regex.push_str(".*");
                }
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map_err(|e| PercentileError::Config(format!("Invalid path pattern '{}': {}", pattern, e)))
}

/// Resolve a path pattern to the existing files it matches, sorted and without duplicates.
///
/// `**` matches any number of directories, `*` any characters within one path
/// segment and `?` exactly one character. A pattern without wildcards resolves to
/// itself when the file exists.
pub fn expand_pattern(pattern: &str) -> PercentileResult<Vec<PathBuf>> {
    let normalized = pattern.trim().replace('\\', "/");
    if normalized.is_empty() {
        return Err(PercentileError::Config("Empty source product path pattern".to_string()));
    }
    if !has_wildcard(&normalized) {
        let path = PathBuf::from(&normalized);
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    }

    let segments: Vec<&str> = normalized.split('/').collect();
    let first_wild = segments.iter().position(|s| has_wildcard(s)).unwrap_or(segments.len());
    let base = if first_wild == 0 {
        PathBuf::from(".")
    } else if first_wild == 1 && segments[0].is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(segments[..first_wild].join("/"))
    };
    let rest = segments[first_wild..].join("/");
    let matcher = wildcard_regex(&rest)?;

    let mut walker = WalkDir::new(&base).follow_links(true).min_depth(1);
    if !rest.contains("**") {
        walker = walker.max_depth(segments.len() - first_wild);
    }

    let mut found = BTreeSet::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Skipping unreadable entry below '{}': {}", base.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(&base) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&relative) {
            found.insert(if first_wild == 0 { PathBuf::from(&relative) } else { entry.into_path() });
        }
    }
    Ok(found.into_iter().collect())
}

/// Opens the source products matched by a set of path patterns and keeps the valid ones
pub struct ProductLoader<'a> {
    patterns: &'a [String],
    validator: &'a ProductValidator,
    reader: &'a dyn ProductReader,
}

impl<'a> ProductLoader<'a> {
    pub fn new(patterns: &'a [String], validator: &'a ProductValidator, reader: &'a dyn ProductReader) -> Self {
        Self {
            patterns,
            validator,
            reader,
        }
    }

    /// Every distinct file matched by any of the patterns
    pub fn resolve_paths(&self) -> PercentileResult<Vec<PathBuf>> {
        let mut paths = BTreeSet::new();
        for pattern in self.patterns {
            let matched = expand_pattern(pattern)?;
            if matched.is_empty() {
                log::warn!("No files found for source product path '{}'", pattern);
            }
            paths.extend(matched);
        }
        Ok(paths.into_iter().collect())
    }

    /// Open and validate every matched file. Unreadable files and invalid
    /// products are logged and skipped; only malformed patterns are errors.
    pub fn load_products(&self) -> PercentileResult<Vec<Box<dyn RasterProduct>>> {
        let paths = self.resolve_paths()?;
        log::info!("Found {} candidate source product files", paths.len());

        let mut products = Vec::new();
        for path in &paths {
            if let Some(product) = self.load(path) {
                products.push(product);
            }
        }
        log::info!("{} of {} source products are valid", products.len(), paths.len());
        Ok(products)
    }

    fn load(&self, path: &Path) -> Option<Box<dyn RasterProduct>> {
        let product = match self.reader.open_product(path) {
            Ok(product) => product,
            Err(e) => {
                log::warn!("Unable to read product '{}': {}", path.display(), e);
                return None;
            }
        };
        // an invalid product is dropped, and with it everything it holds
        self.validator.is_valid(product.as_ref()).then_some(product)
    }
}
