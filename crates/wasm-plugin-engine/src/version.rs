//! Semver parsing and range checks for plugin versions.
//!
//! The engine accepts exactly `major.minor.patch` where each component is a
//! non-negative decimal integer. This is deliberately narrower than full
//! semver: no pre-release tags, no build metadata, no `v` prefix. Leading
//! zeros are accepted (`1.02.3` is valid) and components must fit in `u64`.

/// Returns true when `version` is a valid `x.y.z` version string.
pub fn is_valid_semver(version: &str) -> bool {
    parse_version(version).is_some()
}

/// Parse a `major.minor.patch` string into its integer components.
///
/// Returns `None` for anything that is not exactly three dot-separated
/// non-negative decimal integers. The returned tuple orders versions
/// lexicographically by `(major, minor, patch)`.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = parse_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// A single version component: non-empty, all ASCII digits, no sign.
fn parse_component(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// Check that `version` falls inside the inclusive range `[min, max]`.
///
/// An empty bound is unbounded on that side; an unparseable bound is treated
/// the same as an absent one. An unparseable `version` is never in range.
pub fn version_in_range(version: &str, min: &str, max: &str) -> bool {
    let Some(v) = parse_version(version) else {
        return false;
    };
    if !min.is_empty()
        && let Some(lo) = parse_version(min)
        && v < lo
    {
        return false;
    }
    if !max.is_empty()
        && let Some(hi) = parse_version(max)
        && v > hi
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // is_valid_semver
    // -------------------------------------------------------------------------

    #[test]
    fn plain_version_is_valid() {
        assert!(is_valid_semver("1.2.3"));
        assert!(is_valid_semver("0.0.0"));
        assert!(is_valid_semver("10.200.3000"));
    }

    #[test]
    fn leading_zeros_are_accepted() {
        assert!(is_valid_semver("1.02.3"));
    }

    #[test]
    fn wrong_component_count_is_invalid() {
        assert!(!is_valid_semver("1.2"));
        assert!(!is_valid_semver("1.2.3.4"));
        assert!(!is_valid_semver(""));
        assert!(!is_valid_semver("1"));
    }

    #[test]
    fn signs_and_letters_are_invalid() {
        assert!(!is_valid_semver("1.-2.3"));
        assert!(!is_valid_semver("a.b.c"));
        assert!(!is_valid_semver("+1.2.3"));
        assert!(!is_valid_semver("1.2.3-beta"));
    }

    #[test]
    fn empty_components_are_invalid() {
        assert!(!is_valid_semver("1..3"));
        assert!(!is_valid_semver(".2.3"));
        assert!(!is_valid_semver("1.2."));
    }

    #[test]
    fn oversized_components_are_invalid() {
        assert!(!is_valid_semver("99999999999999999999999.0.0"));
    }

    // -------------------------------------------------------------------------
    // parse_version ordering
    // -------------------------------------------------------------------------

    #[test]
    fn versions_order_componentwise() {
        assert!(parse_version("1.2.3") < parse_version("1.2.4"));
        assert!(parse_version("1.9.0") < parse_version("1.10.0"));
        assert!(parse_version("2.0.0") > parse_version("1.99.99"));
    }

    // -------------------------------------------------------------------------
    // version_in_range
    // -------------------------------------------------------------------------

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(version_in_range("1.0.0", "1.0.0", "2.0.0"));
        assert!(version_in_range("2.0.0", "1.0.0", "2.0.0"));
        assert!(version_in_range("1.5.2", "1.0.0", "2.0.0"));
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(!version_in_range("0.9.9", "1.0.0", "2.0.0"));
        assert!(!version_in_range("2.0.1", "1.0.0", "2.0.0"));
    }

    #[test]
    fn empty_bounds_are_unbounded() {
        assert!(version_in_range("0.0.1", "", "2.0.0"));
        assert!(version_in_range("99.0.0", "1.0.0", ""));
        assert!(version_in_range("5.5.5", "", ""));
    }

    #[test]
    fn invalid_version_is_never_in_range() {
        assert!(!version_in_range("not-a-version", "", ""));
    }

    #[test]
    fn invalid_bound_is_treated_as_absent() {
        assert!(version_in_range("1.0.0", "garbage", "also-garbage"));
    }
}
