//! Entry filtering.
//!
//! Accepts or rejects archive entries by pattern, size, type, and security
//! heuristics before any payload byte is read. The decision order is a data
//! structure (an ordered list of [`EntryCheck`] variants) rather than
//! control flow scattered across methods, and the first rejection wins:
//!
//! 1. security (always active, cannot be configured off)
//! 2. exclude globs
//! 3. include globs (directories pass if they could hold a matching file)
//! 4. size bounds
//! 5. extension allow-list (directories pass, as for include globs)
//! 6. content-type allow-list (supports the `type/*` wildcard form;
//!    directories pass here too)
//! 7. custom predicate
//!
//! Rejections are silent `false` results, never errors: a malicious archive
//! producing rejections is an expected condition, not an exceptional one.

use std::collections::HashSet;
use std::sync::Arc;

/// Entry metadata as seen by the filter. All fields are untrusted.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
    pub name: &'a str,
    pub size: u64,
    pub is_directory: bool,
}

/// Anything the filter can inspect.
pub trait AsEntryInfo {
    fn entry_info(&self) -> EntryInfo<'_>;
}

type Predicate = Arc<dyn Fn(&EntryInfo<'_>) -> bool + Send + Sync>;

/// Immutable decision policy for [`EntryFilter`].
///
/// Every field distinguishes "unset" from "empty": an unset allow-list is
/// not consulted, an explicitly empty one rejects everything.
#[derive(Default, Clone)]
pub struct FilterConfig {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub extensions: Option<Vec<String>>,
    pub content_types: Option<Vec<String>>,
    pub predicate: Option<Predicate>,
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.include = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn size_bounds(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    pub fn extensions(mut self, exts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = Some(exts.into_iter().map(Into::into).collect());
        self
    }

    pub fn content_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.content_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn custom(mut self, predicate: impl Fn(&EntryInfo<'_>) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

/// One stage of the filter chain, evaluated in declaration order.
enum EntryCheck {
    Security,
    Exclude(Vec<String>),
    Include(Vec<String>),
    Size { min: Option<u64>, max: Option<u64> },
    Extensions(HashSet<String>),
    ContentTypes(Vec<String>),
    Custom(Predicate),
}

impl EntryCheck {
    fn passes(&self, entry: &EntryInfo<'_>) -> bool {
        match self {
            EntryCheck::Security => name_is_safe(entry.name),
            EntryCheck::Exclude(patterns) => {
                let name = normalized(entry.name);
                !patterns.iter().any(|p| glob_match(p, &name))
            }
            EntryCheck::Include(patterns) => {
                if patterns.is_empty() {
                    return true;
                }
                // A directory is kept whenever it could contain a matching
                // descendant, so intermediate directories on the way to an
                // included file are never pruned.
                if entry.is_directory {
                    return true;
                }
                let name = normalized(entry.name);
                patterns.iter().any(|p| glob_match(p, &name))
            }
            EntryCheck::Size { min, max } => {
                if min.is_some_and(|m| entry.size < m) {
                    return false;
                }
                !max.is_some_and(|m| entry.size > m)
            }
            EntryCheck::Extensions(allowed) => {
                // Same carve-out as include: a directory has no extension of
                // its own but may hold files that do.
                if entry.is_directory {
                    return true;
                }
                match extension_of(entry.name) {
                    Some(ext) => allowed.contains(&ext),
                    None => false,
                }
            }
            EntryCheck::ContentTypes(allowed) => {
                if entry.is_directory {
                    return true;
                }
                match content_type_for_name(entry.name) {
                    Some(detected) => allowed.iter().any(|a| content_type_matches(a, detected)),
                    None => false,
                }
            }
            EntryCheck::Custom(predicate) => predicate(entry),
        }
    }
}

/// Pure decision function over entry metadata.
pub struct EntryFilter {
    checks: Vec<EntryCheck>,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl EntryFilter {
    /// Build the ordered check chain from a config.
    ///
    /// The security check is always first and always present, independent
    /// of what the config carries.
    pub fn new(config: FilterConfig) -> Self {
        let mut checks = vec![EntryCheck::Security];
        if let Some(patterns) = config.exclude {
            checks.push(EntryCheck::Exclude(patterns));
        }
        if let Some(patterns) = config.include {
            checks.push(EntryCheck::Include(patterns));
        }
        if config.min_size.is_some() || config.max_size.is_some() {
            checks.push(EntryCheck::Size {
                min: config.min_size,
                max: config.max_size,
            });
        }
        if let Some(exts) = config.extensions {
            checks.push(EntryCheck::Extensions(
                exts.iter()
                    .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                    .collect(),
            ));
        }
        if let Some(types) = config.content_types {
            checks.push(EntryCheck::ContentTypes(
                types.iter().map(|t| t.to_ascii_lowercase()).collect(),
            ));
        }
        if let Some(predicate) = config.predicate {
            checks.push(EntryCheck::Custom(predicate));
        }
        Self { checks }
    }

    /// Evaluate the chain; the first failing check rejects the entry.
    pub fn matches(&self, entry: &EntryInfo<'_>) -> bool {
        for check in &self.checks {
            if !check.passes(entry) {
                return false;
            }
        }
        true
    }

    /// Keep the entries that pass, preserving their relative order.
    pub fn filter_entries<T: AsEntryInfo>(&self, entries: Vec<T>) -> Vec<T> {
        entries
            .into_iter()
            .filter(|e| self.matches(&e.entry_info()))
            .collect()
    }
}

/// Hard maximum entry-name length. Anything longer is hostile or broken.
const MAX_NAME_LEN: usize = 1024;

/// Security screen over an attacker-controlled entry name.
///
/// Nothing that fails this check may ever reach a filesystem join. Covers
/// `..` segments in either separator style, absolute paths (POSIX, drive
/// letter, UNC), embedded NULs, and the Unicode direction-control
/// characters used to visually disguise a traversal.
fn name_is_safe(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name.contains('\0') {
        return false;
    }
    if name.chars().any(is_disguise_char) {
        return false;
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return false;
    }
    // Drive-letter prefix ("C:..." with either or no separator).
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return false;
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return false;
    }
    true
}

/// Bidirectional overrides/isolates and related format characters.
fn is_disguise_char(c: char) -> bool {
    matches!(
        c,
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{200E}' | '\u{200F}' | '\u{061C}'
    )
}

/// Normalize an entry name for glob matching: forward slashes only, no
/// trailing directory marker.
fn normalized(name: &str) -> String {
    let unified = name.replace('\\', "/");
    unified.trim_end_matches('/').to_string()
}

fn extension_of(name: &str) -> Option<String> {
    let base = normalized(name);
    let file = base.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Extension-driven content-type lookup.
///
/// Deliberately small: this exists for filtering and chunk sizing, not for
/// serving files, so only types the defaults care about are mapped.
pub(crate) fn content_type_for_name(name: &str) -> Option<&'static str> {
    let ext = extension_of(name)?;
    let ty = match ext.as_str() {
        "txt" | "md" | "log" | "csv" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "wasm" => "application/wasm",
        "exe" | "dll" | "so" | "bin" => "application/octet-stream",
        _ => return None,
    };
    Some(ty)
}

/// `text/*` style wildcard or exact comparison, case-insensitive.
fn content_type_matches(allowed: &str, detected: &str) -> bool {
    if let Some(family) = allowed.strip_suffix("/*") {
        detected
            .split('/')
            .next()
            .is_some_and(|f| f.eq_ignore_ascii_case(family))
    } else {
        allowed.eq_ignore_ascii_case(detected)
    }
}

/// Glob matching over `/`-separated paths.
///
/// `*` and `?` match within a single path segment; `**` matches any number
/// of whole segments (including none).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            // Match zero segments, or consume one and keep the star.
            match_segments(&pattern[1..], path)
                || (!path.is_empty() && match_segments(pattern, &path[1..]))
        }
        Some(seg) => {
            !path.is_empty()
                && match_chars(seg, path[0])
                && match_segments(&pattern[1..], &path[1..])
        }
    }
}

/// Single-segment wildcard matching with backtracking for `*`.
fn match_chars(pattern: &str, text: &str) -> bool {
    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();
    do_match(&pattern_chars, &text_chars)
}
