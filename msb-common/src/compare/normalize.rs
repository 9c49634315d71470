//! Normalized-string helpers feeding the play comparator
//!
//! Both dedup paths compare normalized forms, never raw metadata: casing,
//! stray whitespace, and trailing parenthetical noise ("(Album Version)",
//! "[Remastered 2011]") vary per platform without changing identity.

use once_cell::sync::Lazy;
use regex::Regex;

/// One trailing parenthesized or bracketed group, including surrounding
/// whitespace.
static TRAILING_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[(\[][^()\[\]]*[)\]]\s*$").unwrap());

/// Lowercase, collapse internal whitespace, trim.
pub fn normalize(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`normalize`] plus stripping of trailing parenthetical noise.
///
/// Groups are stripped repeatedly so `"Song (Live) [2011]"` reduces to
/// `"song"`. A title that is nothing but a parenthetical survives as-is.
pub fn normalize_title(s: &str) -> String {
    let normalized = normalize(s);
    let mut out = normalized.clone();
    loop {
        let stripped = TRAILING_NOISE.replace(&out, "").trim().to_string();
        if stripped == out {
            break;
        }
        if stripped.is_empty() {
            return normalized;
        }
        out = stripped;
    }
    out
}
