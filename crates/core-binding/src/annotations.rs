use std::collections::HashMap;

use derive_more::Display;

/// Annotation keys carrying a CPU binding request, highest priority first.
pub(crate) const CPUSET_ANNOTATIONS: [&str; 3] = [
    "scheduling.waters2019.io/core-id",
    "core-id",
    "cpuset.cpus",
];

/// A cpuset list such as `3` or `1,3-5`.
///
/// Never empty, and made of ASCII digits, commas and hyphens only. The value
/// is checked for its characters, not against the host's CPUs.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub(crate) struct CpuSet(String);

impl CpuSet {
    /// Validate a raw annotation value.
    ///
    /// Surrounding whitespace is trimmed and spaces next to `,` or `-` are
    /// dropped. Returns `None` for blank values or values containing any
    /// other character, including a space between two digits.
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        // single core id
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return Some(Self(raw.to_string()));
        }

        let compact = raw
            .split(',')
            .map(|item| {
                item.split('-')
                    .map(|bound| bound.trim_matches(' '))
                    .collect::<Vec<_>>()
                    .join("-")
            })
            .collect::<Vec<_>>()
            .join(",");
        compact
            .bytes()
            .all(|b| b.is_ascii_digit() || b == b',' || b == b'-')
            .then_some(Self(compact))
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

/// First recognised annotation with a non-blank value, as `(key, value)`.
///
/// Keys that are absent or blank fall through to the next one.
pub(crate) fn find_cpuset_annotation(
    annotations: &HashMap<String, String>,
) -> Option<(&'static str, &str)> {
    CPUSET_ANNOTATIONS.iter().find_map(|key| {
        annotations
            .get(*key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| (*key, value))
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parsed(pairs: &[(&str, &str)]) -> Option<String> {
        find_cpuset_annotation(&annotations(pairs))
            .and_then(|(_, raw)| CpuSet::parse(raw))
            .map(CpuSet::into_inner)
    }

    #[test]
    fn no_recognised_key_yields_nothing() {
        assert_eq!(parsed(&[]), None);
        assert_eq!(
            parsed(&[("io.kubernetes.pod/cpus", "1"), ("core", "2")]),
            None
        );
    }

    #[test]
    fn digits_only_value_is_kept_verbatim() {
        for value in ["0", "7", "63", "0012"] {
            assert_eq!(parsed(&[("core-id", value)]).as_deref(), Some(value));
        }
    }

    #[test]
    fn list_and_range_expression_is_kept() {
        assert_eq!(parsed(&[("cpuset.cpus", "1,3-5")]).as_deref(), Some("1,3-5"));
    }

    #[test]
    fn incidental_spaces_are_stripped() {
        assert_eq!(parsed(&[("core-id", " 1, 3-5 ")]).as_deref(), Some("1,3-5"));
        assert_eq!(parsed(&[("core-id", "\t4\n")]).as_deref(), Some("4"));
    }

    #[test]
    fn letters_reject_the_whole_value() {
        assert_eq!(parsed(&[("core-id", "abc")]), None);
        assert_eq!(parsed(&[("core-id", "1,a-5")]), None);
        assert_eq!(parsed(&[("core-id", "1;2")]), None);
        assert_eq!(parsed(&[("core-id", "1,\t2")]), None);
    }

    #[test]
    fn space_between_digits_is_not_joined() {
        assert_eq!(parsed(&[("core-id", "1 2")]), None);
        assert_eq!(parsed(&[("core-id", "1,2 3-5")]), None);
        assert_eq!(parsed(&[("core-id", "1 - 3 ,  5")]).as_deref(), Some("1-3,5"));
    }

    #[test]
    fn first_key_in_priority_order_wins() {
        assert_eq!(
            parsed(&[("core-id", "2"), ("cpuset.cpus", "4-6")]).as_deref(),
            Some("2")
        );
        assert_eq!(
            parsed(&[
                ("scheduling.waters2019.io/core-id", "9"),
                ("core-id", "2"),
                ("cpuset.cpus", "4-6"),
            ])
            .as_deref(),
            Some("9")
        );
    }

    #[test]
    fn blank_value_falls_through_to_next_key() {
        assert_eq!(
            parsed(&[("scheduling.waters2019.io/core-id", "   "), ("cpuset.cpus", "4-6")])
                .as_deref(),
            Some("4-6")
        );
    }

    #[test]
    fn malformed_higher_priority_value_does_not_fall_through() {
        assert_eq!(
            find_cpuset_annotation(&annotations(&[("core-id", "x"), ("cpuset.cpus", "4-6")])),
            Some(("core-id", "x"))
        );
        assert_eq!(parsed(&[("core-id", "x"), ("cpuset.cpus", "4-6")]), None);
    }

    #[test]
    fn parse_never_returns_an_empty_or_spaced_set() {
        for raw in ["", "   ", " 1 ", "1 ,2", "2-3 , 5"] {
            if let Some(cpus) = CpuSet::parse(raw) {
                let cpus = cpus.to_string();
                assert!(!cpus.is_empty());
                assert!(!cpus.contains(char::is_whitespace), "{raw:?}");
            }
        }
    }
}
