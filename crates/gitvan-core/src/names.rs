use crate::{Error, Result};

/// Validate a single ref path component (a lock name or snapshot key).
/// Conservative subset of git refname rules: one segment, printable, and
/// none of the characters git rejects in refnames.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(invalid("leading or trailing dot"));
    }
    if name.ends_with(".lock") {
        return Err(invalid("reserved .lock suffix"));
    }
    if name.contains("..") || name.contains("@{") {
        return Err(invalid("forbidden sequence"));
    }
    for c in name.chars() {
        if c.is_control() || c.is_whitespace() {
            return Err(invalid("control or whitespace character"));
        }
        if matches!(c, '/' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(invalid("character forbidden in refnames"));
        }
    }
    Ok(())
}
