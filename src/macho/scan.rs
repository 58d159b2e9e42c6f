//! Masked byte-pattern search.
//!
//! A window matches when `(buf[i] & mask[i]) == (pattern[i] & mask[i])` for
//! every position; a zero mask byte is a wildcard. The scan is a plain linear
//! pass and the first match wins.

/// True if `pattern` (under `mask`) matches `buf` starting at `at`.
pub fn matches_at(buf: &[u8], at: usize, pattern: &[u8], mask: &[u8]) -> bool {
    let end = match at.checked_add(pattern.len()) {
        Some(e) if e <= buf.len() => e,
        _ => return false,
    };
    buf[at..end]
        .iter()
        .zip(pattern.iter().zip(mask.iter()))
        .all(|(b, (p, m))| (b & m) == (p & m))
}

/// Offset of the first masked match of `pattern` in `buf`.
/// Empty patterns and pattern/mask length mismatches never match.
pub fn find_masked(buf: &[u8], pattern: &[u8], mask: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() != mask.len() || pattern.len() > buf.len() {
        return None;
    }
    (0..=buf.len() - pattern.len()).find(|&i| matches_at(buf, i, pattern, mask))
}
