//! Identity document parsing and boundary enforcement.
//!
//! The identity is a human-authored markdown file read before every cycle.
//! The engine only interprets one section: `## Boundaries`, a list of path
//! patterns it must never modify. Patterns are project-relative prefixes or
//! simple globs (`*`, `?`, character classes). Everything else in the
//! document is passed verbatim into prompts.

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Parsed identity: full text plus the compiled boundary matcher.
#[derive(Debug, Clone)]
pub struct Identity {
    text: String,
    boundaries: Vec<String>,
    matcher: GlobSet,
}

impl Identity {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let boundaries = extract_boundaries(text);
        let matcher = build_matcher(&boundaries)?;
        Ok(Self {
            text: text.to_string(),
            boundaries,
            matcher,
        })
    }

    /// Full document text, for prompt assembly.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn boundaries(&self) -> &[String] {
        &self.boundaries
    }

    /// Whether a project-relative path falls under any boundary pattern.
    pub fn is_protected(&self, path: &str) -> bool {
        let normalized = normalize(path);
        if normalized.is_empty() {
            return false;
        }
        self.matcher.is_match(&normalized)
    }

    /// The first protected path among `paths`, if any.
    pub fn first_violation<'a>(&self, paths: &'a [String]) -> Option<&'a str> {
        paths
            .iter()
            .map(String::as_str)
            .find(|p| self.is_protected(p))
    }
}

/// Pull the `- pattern` entries out of the `## Boundaries` section.
fn extract_boundaries(text: &str) -> Vec<String> {
    let header = Regex::new(r"(?mi)^##\s+Boundaries\s*$").expect("static regex");
    let Some(found) = header.find(text) else {
        return Vec::new();
    };
    let rest = &text[found.end()..];
    let mut patterns = Vec::new();
    for line in rest.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("## ") {
            break;
        }
        if let Some(entry) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            let entry = entry.trim().trim_matches('`').trim();
            if !entry.is_empty() {
                patterns.push(normalize(entry));
            }
        }
    }
    patterns
}

/// Compile boundary patterns. A bare path (no glob metacharacters) matches
/// itself and everything beneath it; a glob pattern matches as written.
fn build_matcher(patterns: &[String]) -> EngineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let has_meta = pattern.contains(['*', '?', '[']);
        if has_meta {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => {
                    warn!(pattern, error = %e, "unparseable boundary glob; treated as prefix");
                    add_prefix(&mut builder, pattern)?;
                }
            }
        } else {
            add_prefix(&mut builder, pattern)?;
        }
    }
    builder
        .build()
        .map_err(|e| EngineError::config(format!("boundary patterns: {e}")))
}

fn add_prefix(builder: &mut GlobSetBuilder, prefix: &str) -> EngineResult<()> {
    let base = prefix.trim_end_matches('/');
    let exact = Glob::new(base)
        .map_err(|e| EngineError::config(format!("boundary '{prefix}': {e}")))?;
    let subtree = Glob::new(&format!("{base}/**"))
        .map_err(|e| EngineError::config(format!("boundary '{prefix}': {e}")))?;
    builder.add(exact);
    builder.add(subtree);
    Ok(())
}

fn normalize(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_end_matches('/').to_string()
}
