//! Canonical naming for environments and their engine sessions.
//!
//! Every sync and forward session belonging to one project lives under a
//! single name derived from the project name. The derivation is pure, so a
//! later invocation finds the sessions an earlier one created without
//! caching any engine identifiers locally.

use std::fmt;

const SESSION_PREFIX: &str = "vessel-";

/// Canonical, slugified identifier addressing one project's sessions.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SessionName(String);

impl SessionName {
    /// Returns the name used for the bidirectional sync session.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name of the forward session at `index` in the rule list.
    #[must_use]
    pub fn forward(&self, index: usize) -> String {
        format!("{}-{index}", self.0)
    }

    /// Returns `true` when `candidate` is one of this name's forward
    /// sessions, that is `<name>-<digits>`.
    #[must_use]
    pub fn owns_forward(&self, candidate: &str) -> bool {
        candidate
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|index| !index.is_empty() && index.chars().all(|ch| ch.is_ascii_digit()))
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the canonical session name for `project_name`.
///
/// The result only contains `[a-z0-9-]` and always starts with `vessel`.
#[must_use]
pub fn derive_session_name(project_name: &str) -> SessionName {
    SessionName(slugify(&format!("{SESSION_PREFIX}{project_name}")))
}

/// Lowercases ASCII alphanumerics and collapses every other run of
/// characters into a single hyphen, trimming hyphens at either end.
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_owned()
}
