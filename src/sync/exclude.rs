//! Exclude pattern matching for sync operations.
//!
//! Supports .gitignore-style patterns: `!` negation, trailing `/` for
//! directory-only rules, leading or inner `/` to anchor at the sync root.
//! A rule that matches a directory also matches everything below it. When
//! several rules match, the most specific (longest) pattern wins, and the
//! later rule wins a tie.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Result, SyncError};

/// File name prefix of the engine's own staging files. Never synced.
pub const TEMP_PREFIX: &str = ".podsync-";

#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    dir_only: bool,
    specificity: usize,
}

/// One ordered set of exclude patterns.
#[derive(Debug, Clone)]
pub struct ExcludePatterns {
    /// Compiled glob set; index `i` belongs to `rules[i]`.
    glob_set: GlobSet,
    rules: Vec<Rule>,
    /// Raw pattern strings (for display and the Init handshake).
    patterns: Vec<String>,
}

impl Default for ExcludePatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl ExcludePatterns {
    /// Create a new empty exclude pattern set.
    pub fn new() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            rules: Vec::new(),
            patterns: Vec::new(),
        }
    }

    /// Create from a list of patterns. Blank lines and `#` comments are skipped.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut rules = Vec::new();
        let mut raw = Vec::new();

        for pattern in patterns {
            let line = pattern.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (glob, rule) = compile(line)?;
            builder.add(glob);
            rules.push(rule);
            raw.push(line.to_string());
        }

        let glob_set = builder.build().map_err(|e| SyncError::InvalidPattern {
            pattern: raw.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            glob_set,
            rules,
            patterns: raw,
        })
    }

    /// Parse patterns from ignore-file content (one per line).
    pub fn parse_gitignore(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content.lines().collect();
        Self::from_patterns(&lines)
    }

    /// Get the list of patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide a path against this set alone.
    ///
    /// `Some(true)` means excluded, `Some(false)` means explicitly re-included
    /// by a negated rule, `None` means no rule matched.
    pub fn decide(&self, path: &str, is_dir: bool) -> Option<bool> {
        if self.rules.is_empty() {
            return None;
        }

        let path = path.trim_matches('/');
        if path.is_empty() {
            return None;
        }

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut best: Option<(usize, usize)> = None;

        for depth in 1..=components.len() {
            let prefix = components[..depth].join("/");
            // Ancestors are directories by definition.
            let prefix_is_dir = depth < components.len() || is_dir;

            for idx in self.glob_set.matches(&prefix) {
                let rule = &self.rules[idx];
                if rule.dir_only && !prefix_is_dir {
                    continue;
                }
                let rank = (rule.specificity, idx);
                if best.map_or(true, |b| rank > b) {
                    best = Some(rank);
                }
            }
        }

        best.map(|(_, idx)| !self.rules[idx].negated)
    }

    /// Check if a path should be excluded.
    pub fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
        self.decide(path, is_dir) == Some(true)
    }
}

fn compile(line: &str) -> Result<(globset::Glob, Rule)> {
    let invalid = |reason: &str| SyncError::InvalidPattern {
        pattern: line.to_string(),
        reason: reason.to_string(),
    };

    let (negated, body) = match line.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let dir_only = body.ends_with('/');
    let body = body.trim_end_matches('/');
    let anchored = body.starts_with('/') || body.contains('/');
    let body = body.trim_start_matches('/');

    if body.is_empty() {
        return Err(invalid("pattern is empty"));
    }

    let glob = if anchored {
        body.to_string()
    } else {
        format!("**/{}", body)
    };

    let compiled = GlobBuilder::new(&glob)
        .literal_separator(true)
        .build()
        .map_err(|e| invalid(&e.to_string()))?;

    Ok((
        compiled,
        Rule {
            negated,
            dir_only,
            specificity: body.len(),
        },
    ))
}

/// Which pipelines may see a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub upload: bool,
    pub download: bool,
}

impl Visibility {
    pub const HIDDEN: Visibility = Visibility {
        upload: false,
        download: false,
    };
}

/// The three exclude sets of a session, layered: the general set hides a path
/// from both directions, the upload and download sets only from their own.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    general: ExcludePatterns,
    upload: ExcludePatterns,
    download: ExcludePatterns,
}

impl ExclusionFilter {
    pub fn new(general: ExcludePatterns, upload: ExcludePatterns, download: ExcludePatterns) -> Self {
        Self {
            general,
            upload,
            download,
        }
    }

    /// Filter with only a general set (what the remote agent runs with).
    pub fn general_only(general: ExcludePatterns) -> Self {
        Self::new(general, ExcludePatterns::new(), ExcludePatterns::new())
    }

    pub fn general(&self) -> &ExcludePatterns {
        &self.general
    }

    pub fn visibility(&self, path: &str, is_dir: bool) -> Visibility {
        if is_temp_file(path) || self.general.is_excluded(path, is_dir) {
            return Visibility::HIDDEN;
        }

        Visibility {
            upload: !self.upload.is_excluded(path, is_dir),
            download: !self.download.is_excluded(path, is_dir),
        }
    }

    pub fn is_upload_visible(&self, path: &str, is_dir: bool) -> bool {
        self.visibility(path, is_dir).upload
    }

    pub fn is_download_visible(&self, path: &str, is_dir: bool) -> bool {
        self.visibility(path, is_dir).download
    }

    /// Hidden from both directions by the general set.
    pub fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
        self.visibility(path, is_dir) == Visibility::HIDDEN
    }
}

/// Whether the last path component is one of our staging files.
pub fn is_temp_file(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map_or(false, |name| name.starts_with(TEMP_PREFIX))
}
