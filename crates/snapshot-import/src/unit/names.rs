//! Unique name generation.

use std::collections::{HashMap, HashSet};

use super::validate::truncate_chars;

/// Hands out names that are unique case-insensitively.
///
/// A taken candidate gets a numeric suffix: `foo` → `foo1` → `foo2`. Every
/// returned name is reserved before it is returned, so later calls never
/// repeat it.
#[derive(Debug, Default, Clone)]
pub struct UniqueNameGenerator {
    reserved: HashSet<String>,
    next_suffix: HashMap<String, u32>,
    max_len: Option<usize>,
}

impl UniqueNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit generated names to `max_len` characters.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len.max(1)),
            ..Self::default()
        }
    }

    /// Mark a name as taken. Returns false if it already was.
    pub fn reserve(&mut self, name: &str) -> bool {
        self.reserved.insert(name.to_lowercase())
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(&name.to_lowercase())
    }

    /// Number of reserved names.
    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// Return `candidate` or the first free suffixed variant, and reserve it.
    pub fn unique_name(&mut self, candidate: &str) -> String {
        let candidate = self.fit(candidate, 0);
        if self.reserve(&candidate) {
            return candidate;
        }

        let key = candidate.to_lowercase();
        let mut suffix = self.next_suffix.get(&key).copied().unwrap_or(1);
        loop {
            let digits = suffix.to_string();
            let name = format!("{}{}", self.fit(&candidate, digits.len()), digits);
            suffix += 1;
            if self.reserve(&name) {
                self.next_suffix.insert(key, suffix);
                return name;
            }
        }
    }

    /// Truncate `base` so that `reserve_chars` more characters still fit.
    fn fit(&self, base: &str, reserve_chars: usize) -> String {
        match self.max_len {
            Some(max) => {
                let room = max.saturating_sub(reserve_chars);
                truncate_chars(base, room).unwrap_or_else(|| base.to_string())
            }
            None => base.to_string(),
        }
    }
}

/// Turn an arbitrary display name into a username candidate.
///
/// Keeps ASCII letters, digits, `_`, `.` and `-`; everything else becomes `_`.
/// Runs of underscores collapse, leading and trailing punctuation is removed,
/// and an empty result falls back to `fallback`.
pub fn sanitize_username(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let ch = if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            ch
        } else {
            '_'
        };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }

    let trimmed = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
