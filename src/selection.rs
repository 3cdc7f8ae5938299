//! Include/exclude selection rules
//!
//! A [`Selector`] decides which source entries take part in a session. Rules
//! are glob patterns anchored at the tree root (a leading `/` is optional),
//! compiled with `globset` so that `*` never crosses a `/` and `**` spans any
//! number of components.
//!
//! ## Semantics
//!
//! - Rules are evaluated in declared order and the **last** matching rule wins.
//! - A rule matches a path when it matches the path itself or any ancestor,
//!   so excluding a directory excludes everything below it.
//! - An include rule whose pattern could match something below a directory
//!   also selects that directory, so the walker can reach the match.
//! - With no matching rule the path is included only if the list contains no
//!   include rule at all.
//! - The root is always included.
//!
//! ```rust
//! use retrace::record::Index;
//! use retrace::selection::{SelectionRule, Selector};
//!
//! # fn main() -> retrace::Result<()> {
//! let selector = Selector::new(&[
//!     SelectionRule::include("/a/*"),
//!     SelectionRule::exclude("/a/b"),
//! ])?;
//! assert!(selector.is_selected(&Index::from_components(["a", "c"]), false));
//! assert!(!selector.is_selected(&Index::from_components(["a", "b", "file"]), false));
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::record::Index;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether a rule selects or deselects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Select matching paths
    Include,
    /// Deselect matching paths
    Exclude,
}

/// User-visible selection rule: a kind and a root-anchored glob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRule {
    /// Include or exclude
    pub kind: RuleKind,
    /// Glob pattern, relative to the tree root
    pub pattern: String,
}

impl SelectionRule {
    /// Creates an include rule for `pattern`.
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            kind: RuleKind::Include,
            pattern: pattern.into(),
        }
    }

    /// Creates an exclude rule for `pattern`.
    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            kind: RuleKind::Exclude,
            pattern: pattern.into(),
        }
    }
}

/// One pattern segment between slashes
#[derive(Debug, Clone)]
enum Segment {
    /// `**`
    AnyDepth,
    /// Anything else, matched against a single component
    Glob(GlobMatcher),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    kind: RuleKind,
    whole: GlobMatcher,
    segments: Vec<Segment>,
}

impl CompiledRule {
    fn compile(rule: &SelectionRule) -> Result<Self> {
        let normalized = rule.pattern.trim_start_matches('/').trim_end_matches('/');
        let whole = GlobBuilder::new(normalized)
            .literal_separator(true)
            .build()?
            .compile_matcher();
        let segments = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Ok(Segment::AnyDepth)
                } else {
                    Ok(Segment::Glob(
                        GlobBuilder::new(s)
                            .literal_separator(true)
                            .build()?
                            .compile_matcher(),
                    ))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind: rule.kind,
            whole,
            segments,
        })
    }

    /// Matches the path or one of its ancestors
    fn matches(&self, index: &Index) -> bool {
        let mut prefix = PathBuf::new();
        for component in index.components() {
            prefix.push(crate::record::bytes_to_os(component));
            if self.whole.is_match(&prefix) {
                return true;
            }
        }
        false
    }

    /// Whether something strictly below `index` could match
    fn could_match_below(&self, index: &Index) -> bool {
        let components = index.components();
        for (i, component) in components.iter().enumerate() {
            match self.segments.get(i) {
                None => return false,
                Some(Segment::AnyDepth) => return true,
                Some(Segment::Glob(glob)) => {
                    if !glob.is_match(crate::record::bytes_to_os(component)) {
                        return false;
                    }
                }
            }
        }
        self.segments.len() > components.len()
    }
}

/// Compiled, ordered selection rules
#[derive(Debug, Clone)]
pub struct Selector {
    rules: Vec<CompiledRule>,
    has_include: bool,
}

impl Selector {
    /// Compile rules in declared order
    ///
    /// # Errors
    ///
    /// - [`crate::RetraceError::InvalidPattern`] if a glob does not parse
    pub fn new(rules: &[SelectionRule]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            has_include: rules.iter().any(|r| r.kind == RuleKind::Include),
            rules: compiled,
        })
    }

    /// A selector that includes everything
    pub fn all() -> Self {
        Self {
            rules: Vec::new(),
            has_include: false,
        }
    }

    /// Whether the entry at `index` takes part in the session
    ///
    /// `is_dir` enables the "include selects ancestors for traversal" rule.
    pub fn is_selected(&self, index: &Index, is_dir: bool) -> bool {
        if index.is_root() {
            return true;
        }
        let mut decision = None;
        for rule in &self.rules {
            if rule.matches(index) {
                decision = Some(rule.kind == RuleKind::Include);
            } else if rule.kind == RuleKind::Include && is_dir && rule.could_match_below(index) {
                decision = Some(true);
            }
        }
        decision.unwrap_or(!self.has_include)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::all()
    }
}
