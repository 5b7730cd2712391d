//! Semver-like version comparison shared by the Agent's `GatewayUpdateAvailable`
//! check and the Gateway's update-request validation.
//!
//! Versions are compared as `(major, minor, patch)`, ignoring any
//! `-prerelease`/`+build` suffix. A version that fails to parse compares
//! as lower than anything parseable, so a malformed string never wins a
//! comparison it has no business winning.

use std::cmp::Ordering;

pub fn parse(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next().unwrap_or(version);
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

/// Case-insensitive semver-like compare. Returns `None` when either side
/// fails to parse, leaving the caller to decide a safe default.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    let a = parse(&a.to_ascii_lowercase())?;
    let b = parse(&b.to_ascii_lowercase())?;
    Some(a.cmp(&b))
}

/// True only when both sides parse and `a` is strictly greater than `b`.
pub fn is_greater(a: &str, b: &str) -> bool {
    matches!(compare(a, b), Some(Ordering::Greater))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_greater_detects_newer() {
        assert!(is_greater("1.2.0", "1.0.0"));
        assert!(!is_greater("1.0.0", "1.2.0"));
        assert!(!is_greater("1.0.0", "1.0.0"));
    }

    #[test]
    fn unparsable_versions_never_compare_greater() {
        assert!(!is_greater("not-a-version", "1.0.0"));
        assert!(!is_greater("1.0.0", "also-not-a-version"));
    }

    #[test]
    fn prerelease_and_build_suffixes_are_ignored() {
        assert_eq!(compare("1.2.0-rc1", "1.2.0+build5"), Some(Ordering::Equal));
    }

    #[test]
    fn compare_is_case_insensitive() {
        assert_eq!(compare("1.2.0-RC1", "1.2.0-rc1"), Some(Ordering::Equal));
    }
}
