use std::sync::LazyLock;

use regex::Regex;

/// Canonical group codes are three digits followed by at most two letters.
pub const MAX_GROUP_CODE_LEN: usize = 5;

static GROUP_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{3}\p{L}{0,2}").expect("invalid regex: group code"));

/// Reduce a raw group number to its canonical code.
///
/// Numbers no longer than [`MAX_GROUP_CODE_LEN`] characters are kept as-is
/// (after trimming). Longer ones are cut down to their leading code; when no
/// code can be found the trimmed raw value is returned unchanged.
pub fn canonical_group_number(raw: &str) -> String {
    let raw = raw.trim();
    if !needs_reconciliation(raw) {
        return raw.to_string();
    }

    match GROUP_CODE.find(raw) {
        Some(code) => code.as_str().to_string(),
        None => raw.to_string(),
    }
}

/// Whether a raw group number is longer than a canonical code.
pub fn needs_reconciliation(raw: &str) -> bool {
    raw.trim().chars().count() > MAX_GROUP_CODE_LEN
}
