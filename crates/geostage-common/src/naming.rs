//! Deterministic name sanitization for files and dataset identifiers
//!
//! Upstream inventories carry free-form Swedish names ("Lämningar län
//! Södermanland"); staged files and feature-class identifiers need stable
//! ASCII-safe equivalents. Both sanitizers are pure, idempotent and bounded
//! to 64 codepoints. The Swedish character map is the only non-ASCII
//! handling; everything else is locale-independent.

/// Maximum length of any sanitized name, in codepoints.
pub const MAX_NAME_LEN: usize = 64;

const FALLBACK_NAME: &str = "unnamed";

fn fold_swedish(c: char) -> char {
    match c {
        'å' | 'ä' => 'a',
        'ö' => 'o',
        'Å' | 'Ä' => 'A',
        'Ö' => 'O',
        other => other,
    }
}

// Underscores count as separators so runs like "a__b" collapse too.
fn is_word(c: char) -> bool {
    c.is_alphanumeric()
}

fn truncate_codepoints(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Sanitize a free-form name for use as a file or directory name.
///
/// Folds Swedish characters to ASCII, lowercases, collapses runs of
/// non-word characters to a single `_`, trims leading/trailing `_` and
/// truncates to [`MAX_NAME_LEN`] codepoints. Empty input yields `unnamed`.
///
/// The function is idempotent: `sanitize_file_name(&sanitize_file_name(x))
/// == sanitize_file_name(x)`.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars().map(fold_swedish).flat_map(char::to_lowercase) {
        if is_word(c) {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    let out = truncate_codepoints(out.trim_matches('_'), MAX_NAME_LEN);
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        out
    }
}

/// Sanitize a free-form name into a database-style identifier.
///
/// Applies [`sanitize_file_name`], then restricts the alphabet to
/// `[a-z0-9_]`, collapses `_` runs and prefixes `_` when the result would
/// start with a digit. Idempotent and bounded like the file mode.
pub fn sanitize_identifier(name: &str) -> String {
    let file_safe = sanitize_file_name(name);
    let mut out = String::with_capacity(file_safe.len());
    let mut prev_underscore = false;
    for c in file_safe.chars() {
        let mapped = if c.is_ascii_alphanumeric() { c } else { '_' };
        if mapped == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(mapped);
            prev_underscore = false;
        }
    }
    let trimmed = out.trim_matches('_');
    let mut result = if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    };
    if result.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        result.insert(0, '_');
    }
    let result = truncate_codepoints(&result, MAX_NAME_LEN);
    result.trim_end_matches('_').to_string()
}

/// Resolve a name collision against a set of already-used identifiers.
///
/// Returns `candidate` unchanged when unused, otherwise the smallest
/// integer-suffixed variant `candidate_1`, `candidate_2`, … that is not in
/// `used`. The base is truncated before suffixing so the result never
/// exceeds [`MAX_NAME_LEN`] codepoints. The caller owns inserting the
/// returned name into `used`.
pub fn resolve_collision(
    candidate: &str,
    used: &std::collections::HashSet<String>,
) -> String {
    let candidate = truncate_codepoints(candidate, MAX_NAME_LEN);
    if !used.contains(&candidate) {
        return candidate;
    }
    let mut idx: u32 = 1;
    loop {
        let suffix = format!("_{}", idx);
        let base = truncate_codepoints(&candidate, MAX_NAME_LEN - suffix.chars().count());
        let attempt = format!("{}{}", base.trim_end_matches('_'), suffix);
        if !used.contains(&attempt) {
            return attempt;
        }
        idx += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_swedish_chars_folded() {
        assert_eq!(sanitize_file_name("Lämningar Län"), "lamningar_lan");
        assert_eq!(sanitize_file_name("SJÖAR och Åar"), "sjoar_och_aar");
    }

    #[test]
    fn test_non_word_runs_collapse() {
        assert_eq!(sanitize_file_name("a - b -- c"), "a_b_c");
        assert_eq!(sanitize_file_name("  kust//zon  "), "kust_zon");
        assert_eq!(sanitize_file_name("x__y"), "x_y");
    }

    #[test]
    fn test_empty_becomes_unnamed() {
        assert_eq!(sanitize_file_name(""), "unnamed");
        assert_eq!(sanitize_file_name("---"), "unnamed");
        assert_eq!(sanitize_identifier("!!!"), "unnamed");
    }

    #[test]
    fn test_file_name_idempotent() {
        for input in [
            "Lämningar Län Södermanland",
            "a - b -- c",
            "ÅÄÖ!!!",
            "x".repeat(200).as_str(),
            "trailing_underscore_",
        ] {
            let once = sanitize_file_name(input);
            assert_eq!(sanitize_file_name(&once), once, "not idempotent: {input}");
        }
    }

    #[test]
    fn test_identifier_idempotent() {
        for input in ["9 kantzoner", "aé", "Natura 2000-områden", "_x_"] {
            let once = sanitize_identifier(input);
            assert_eq!(sanitize_identifier(&once), once, "not idempotent: {input}");
        }
    }

    #[test]
    fn test_identifier_digit_prefix() {
        let id = sanitize_identifier("3006 zoner");
        assert!(id.starts_with('_'));
        assert_eq!(id, "_3006_zoner");
    }

    #[test]
    fn test_length_bound() {
        let long = "långt namn ".repeat(30);
        assert!(sanitize_file_name(&long).chars().count() <= MAX_NAME_LEN);
        assert!(sanitize_identifier(&long).chars().count() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_identifier_charset() {
        let id = sanitize_identifier("Skyddade områden: é & ü (2024)");
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_collision_untouched_when_free() {
        let used = HashSet::new();
        assert_eq!(resolve_collision("nvv_kust", &used), "nvv_kust");
    }

    #[test]
    fn test_collision_suffixes_in_order() {
        let mut used = HashSet::new();
        used.insert("nvv_kust".to_string());
        assert_eq!(resolve_collision("nvv_kust", &used), "nvv_kust_1");
        used.insert("nvv_kust_1".to_string());
        assert_eq!(resolve_collision("nvv_kust", &used), "nvv_kust_2");
    }

    #[test]
    fn test_collision_respects_length_bound() {
        let base = "a".repeat(MAX_NAME_LEN);
        let mut used = HashSet::new();
        used.insert(base.clone());
        let resolved = resolve_collision(&base, &used);
        assert!(resolved.chars().count() <= MAX_NAME_LEN);
        assert!(resolved.ends_with("_1"));
    }

    #[test]
    fn test_collision_deterministic() {
        let mut used = HashSet::new();
        used.insert("lst_bete".to_string());
        let a = resolve_collision("lst_bete", &used);
        let b = resolve_collision("lst_bete", &used);
        assert_eq!(a, b);
    }
}
