//! Discovers `v=spf1` policies in a TXT record set.

use crate::error::SpfError;

/// Outcome of filtering a TXT record set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TxtClasses {
    /// Strings that are exactly `v=spf1`, or `v=spf1` followed by a space
    /// or tab. Case-sensitive on the prefix.
    pub policies: Vec<String>,
    /// Strings that look SPF-shaped but fail the strict prefix; reported
    /// for diagnostics, never chosen as policy.
    pub candidates: Vec<String>,
}

/// Partitions TXT strings into strict policies and loose candidates.
pub fn classify_txt(txts: &[String]) -> TxtClasses {
    let mut classes = TxtClasses::default();
    for s in txts {
        if is_policy(s) {
            classes.policies.push(s.clone());
        } else if is_spf_candidate(s) {
            classes.candidates.push(s.clone());
        }
    }
    classes
}

/// Selects the single policy: none is [`SpfError::SpfNotFound`], more than
/// one is [`SpfError::TooManySpfRecords`].
pub fn select_policy(classes: &TxtClasses) -> Result<&str, SpfError> {
    match classes.policies.as_slice() {
        [] => Err(SpfError::SpfNotFound),
        [one] => Ok(one),
        _ => Err(SpfError::TooManySpfRecords),
    }
}

/// A record with a version section of exactly `v=spf1`, terminated by a
/// space, a tab, or the end of the record. `v=spf10` does not match.
fn is_policy(s: &str) -> bool {
    const V: &str = "v=spf1";
    match s.strip_prefix(V) {
        Some("") => true,
        Some(rest) => rest.starts_with(' ') || rest.starts_with('\t'),
        None => false,
    }
}

/// Loose detector for SPF-shaped strings: `[WS* v]? WS* (=|:) WS* spf`,
/// case-insensitive, anywhere in the string. Used only to report
/// near-miss records to the listener.
pub fn is_spf_candidate(s: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        V,
        Sep,
        Spf,
    }

    let b = s.as_bytes();
    let mut i = 0;
    let mut state = State::V;

    while i < b.len() {
        while i < b.len() && b[i].is_ascii_whitespace() {
            i += 1;
        }
        // Need at least a separator plus "spf" ahead.
        if i + 4 > b.len() {
            return false;
        }

        match state {
            State::V => {
                let c = b[i];
                if c == b'=' || c == b':' {
                    state = State::Spf;
                } else if c.eq_ignore_ascii_case(&b'v') {
                    state = State::Sep;
                }
                i += 1;
            }
            State::Sep => {
                let c = b[i];
                state = if c == b'=' || c == b':' {
                    State::Spf
                } else {
                    State::V
                };
                i += 1;
            }
            State::Spf => {
                if b.len() - i >= 3 && b[i..i + 3].eq_ignore_ascii_case(b"spf") {
                    return true;
                }
                i += 1;
                state = State::V;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strict_policy_prefix() {
        assert!(is_policy("v=spf1"));
        assert!(is_policy("v=spf1 -all"));
        assert!(is_policy("v=spf1\tip4:1.2.3.4"));
        assert!(!is_policy("v=spf10 -all"));
        assert!(!is_policy("V=spf1 -all"));
        assert!(!is_policy(" v=spf1"));
        assert!(!is_policy("v=spf2 -all"));
    }

    #[test]
    fn candidates() {
        let cases = [
            ("v=spf1", true),
            ("v:spf1", true),
            ("  v=spf1", true),
            ("v  =spf1", true),
            ("v = spf1", true),
            ("v=SPF1", true),
            ("V=spf1", true),
            ("V=sPf1", true),
            ("text v=spf1", true),
            ("v=spf1 additional text", true),
            ("", false),
            ("   ", false),
            ("=spf1", true),
            ("vspf1", false),
            ("v=", false),
            ("v-spf1", false),
            ("v", false),
            ("spf", false),
            ("header v=spf1 include:_spf.example.com ~all", true),
        ];
        for (input, want) in cases {
            assert_eq!(is_spf_candidate(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn classify_partitions() {
        let txts = strs(&[
            "some text",
            "v=spf1 -all",
            "v=spf10 ip4:1.2.3.4",
            "V=spf1 ~all",
        ]);
        let classes = classify_txt(&txts);
        assert_eq!(classes.policies, strs(&["v=spf1 -all"]));
        assert_eq!(
            classes.candidates,
            strs(&["v=spf10 ip4:1.2.3.4", "V=spf1 ~all"])
        );
    }

    #[test]
    fn select_outcomes() {
        let none = classify_txt(&strs(&["hello"]));
        assert_eq!(select_policy(&none), Err(SpfError::SpfNotFound));

        let one = classify_txt(&strs(&["v=spf1 -all"]));
        assert_eq!(select_policy(&one), Ok("v=spf1 -all"));

        let many = classify_txt(&strs(&["v=spf1 -all", "v=spf1 ~all"]));
        assert_eq!(select_policy(&many), Err(SpfError::TooManySpfRecords));
    }
}
