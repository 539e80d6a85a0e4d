//! Association between resource keys and identifiers reported by the host.
//!
//! Hosts name installed plugins by directory and entry file
//! (`widget-main/widget.php`), which rarely matches the repository name
//! exactly. Matching compares the key's `name` against both the directory
//! segment and the entry file stem of an identifier, after normalisation:
//!
//! - ASCII case is folded.
//! - `_`, `.`, whitespace and `-` are separators; runs collapse to one `-`
//!   and leading/trailing separators are dropped.
//!
//! On normalised values, three equivalence classes are recognised, strongest
//! first:
//!
//! - [`MatchKind::Exact`]: the directory or the entry stem equals the name.
//! - [`MatchKind::Prefix`]: the directory is `name-` followed by a single
//!   qualifier token or a numeric version (`widget-main`, `widget-1-2-0`).
//! - [`MatchKind::Contains`]: the name (at least three characters) occurs as a
//!   run of whole `-` tokens inside the directory (`acme-widget-pro`).
//!
//! An entry stem that embeds the name in a longer one (`widget-pro.php` for
//! `widget`) names a different plugin, and the identifier does not match at
//! all.

use crate::ResourceKey;

const MIN_CONTAINS_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Contains,
    Prefix,
    Exact,
}

pub fn normalize_identifier(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_separator = false;
    for ch in value.chars() {
        if ch == '-' || ch == '_' || ch == '.' || ch.is_whitespace() {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push('-');
        }
        pending_separator = false;
        out.extend(ch.to_lowercase());
    }
    out
}

pub fn match_host_identifier(key: &ResourceKey, identifier: &str) -> Option<MatchKind> {
    let name = normalize_identifier(key.name());
    if name.is_empty() {
        return None;
    }

    let trimmed = identifier.trim().trim_matches('/');
    let (directory, file) = match trimmed.split_once('/') {
        Some((directory, rest)) => (directory, Some(rest.rsplit('/').next().unwrap_or(rest))),
        None => (trimmed, None),
    };
    let stem = file.map(|file| match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file,
    });

    if let Some(stem) = stem.map(normalize_identifier) {
        if stem == name {
            return Some(MatchKind::Exact);
        }
        if contains_tokens(&stem, &name) {
            return None;
        }
    }
    classify_directory(&name, &normalize_identifier(directory))
}

fn classify_directory(name: &str, candidate: &str) -> Option<MatchKind> {
    if candidate.is_empty() {
        return None;
    }
    if candidate == name {
        return Some(MatchKind::Exact);
    }
    if candidate
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(is_qualifier)
    {
        return Some(MatchKind::Prefix);
    }
    if name.len() >= MIN_CONTAINS_LEN && contains_tokens(candidate, name) {
        return Some(MatchKind::Contains);
    }
    None
}

/// A branch-like single token, or a dotted version such as `1-2-0`/`v2-1`.
fn is_qualifier(suffix: &str) -> bool {
    let tokens: Vec<&str> = suffix.split('-').collect();
    if tokens.len() == 1 {
        return !suffix.is_empty();
    }
    tokens.iter().all(|token| {
        let digits = token.strip_prefix('v').unwrap_or(token);
        !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
    })
}

fn contains_tokens(candidate: &str, name: &str) -> bool {
    let haystack: Vec<&str> = candidate.split('-').collect();
    let needle: Vec<&str> = name.split('-').collect();
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_slice())
}

/// Picks the strongest match among host identifiers.
///
/// `known` lists the other resources in play. A candidate is left to a
/// sibling that matches it more strongly, or equally strongly with a longer
/// name, so `acme/widget` never claims the directory of `acme/widget-pro`.
/// Ties prefer the shortest identifier, then lexical order, so the result
/// does not depend on the order the host listed them in.
pub fn find_host_match<'a, T, F>(
    key: &ResourceKey,
    known: &[ResourceKey],
    candidates: &'a [T],
    identifier: F,
) -> Option<&'a T>
where
    F: Fn(&T) -> &str,
{
    let name = normalize_identifier(key.name());
    let siblings: Vec<(&ResourceKey, String)> = known
        .iter()
        .filter(|other| *other != key)
        .map(|other| (other, normalize_identifier(other.name())))
        .filter(|(_, other_name)| *other_name != name)
        .collect();

    candidates
        .iter()
        .filter_map(|candidate| {
            let id = identifier(candidate);
            let kind = match_host_identifier(key, id)?;
            let claimed_by_sibling = siblings.iter().any(|(other, other_name)| {
                match match_host_identifier(other, id) {
                    Some(other_kind) => {
                        other_kind > kind || (other_kind == kind && other_name.len() > name.len())
                    }
                    None => false,
                }
            });
            (!claimed_by_sibling).then_some((kind, candidate))
        })
        .max_by(|(left_kind, left), (right_kind, right)| {
            let left_id = identifier(left);
            let right_id = identifier(right);
            left_kind
                .cmp(right_kind)
                .then_with(|| right_id.len().cmp(&left_id.len()))
                .then_with(|| right_id.cmp(left_id))
        })
        .map(|(_, candidate)| candidate)
}
