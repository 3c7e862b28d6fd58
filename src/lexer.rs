//! Splits a policy string into [`Token`]s, tagging syntactic errors.

use lazy_static::lazy_static;
use regex::Regex;

use crate::token::{Qualifier, TermKind, Token};

lazy_static! {
    /// RFC 7208 `name = ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )`.
    static ref RE_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9\-_.]*$").unwrap();
    /// RFC 7208 `macro-string`, with `macro-expand` spelled out.
    static ref RE_MACRO_STRING: Regex = Regex::new(
        r"^((%\{[slodiphcrtv][0-9]*r?[.\-+,/_=]*\})|%%|%_|%-|[\x21\x22\x23\x24\x26-\x7E])*$"
    )
    .unwrap();
}

/// Reads an SPF record and returns its terms as tokens. Terms are
/// delimited by runs of whitespace. Malformed terms come back as
/// [`TermKind::Err`] tokens carrying the raw text so the parser can
/// attribute the failure.
pub fn lex(input: &str) -> Vec<Token> {
    input
        .split(|c| c == ' ' || c == '\t' || c == '\n')
        .filter(|term| !term.is_empty())
        .map(scan_term)
        .collect()
}

/// Scans a single whitespace-delimited term.
///
/// The first character(s) may be qualifiers; two in succession poison the
/// token. The identifier runs until `=`, `:` or `/` (the dual-CIDR
/// shortcut, whose value keeps the leading slash). Identifier-delimiter
/// mismatches produce Err tokens, except that an unknown identifier with
/// `=` and an RFC-shaped name/macro-string survives as an unknown
/// modifier.
fn scan_term(original: &str) -> Token {
    let mut t = Token::new(TermKind::Err, Qualifier::Plus);
    let mut has_qualifier = false;
    let mut start = 0;
    let mut delim: Option<(usize, char)> = None;

    for (i, ch) in original.char_indices() {
        match ch {
            '+' | '-' | '~' | '?' => {
                if has_qualifier {
                    t.qualifier = Qualifier::Err;
                } else {
                    t.qualifier = Qualifier::from_char(ch).unwrap();
                    has_qualifier = true;
                }
                start = i + 1;
            }
            '=' | ':' | '/' => {
                delim = Some((i, ch));
                break;
            }
            _ => {}
        }
    }

    if let Some((i, ch)) = delim {
        let name = &original[start..i];
        let name_kind = TermKind::from_name(name);
        let saved_qualifier = t.qualifier;
        if t.qualifier != Qualifier::Err {
            t.kind = name_kind;
            let value_start = if ch == '/' { i } else { i + 1 };
            t.value = original[value_start..].to_string();
        }
        let effective_delim = if ch == '/' { ':' } else { ch };
        if t.value.is_empty() || !check_token_syntax(&t, effective_delim) {
            t.qualifier = Qualifier::Err;
            t.kind = TermKind::Err;
        }
        t.key = name.to_string();
        // Unknown-modifier rescue: only identifiers that are not a known
        // mechanism or modifier name qualify.
        if ch == '='
            && t.kind == TermKind::Err
            && name_kind == TermKind::Err
            && saved_qualifier != Qualifier::Err
            && RE_NAME.is_match(name)
            && RE_MACRO_STRING.is_match(&t.value)
        {
            t.kind = TermKind::UnknownModifier;
            t.qualifier = saved_qualifier;
        }
    }

    if t.is_err() {
        let end = match delim {
            Some((i, ch)) => i + ch.len_utf8(),
            None => original.len(),
        };
        let retry = TermKind::from_name(&original[start..end]);
        if retry == TermKind::Err || t.qualifier == Qualifier::Err {
            t.kind = TermKind::Err;
            t.qualifier = Qualifier::Err;
            t.value = original.to_string();
            t.key.clear();
        } else {
            t.kind = retry;
            t.value.clear();
        }
    }

    t
}

fn check_token_syntax(t: &Token, delimiter: char) -> bool {
    if t.kind == TermKind::Err && t.qualifier == Qualifier::Err {
        return true;
    }
    // The v=spf1 starter is the one mechanism spelled with '='.
    if t.kind == TermKind::Version {
        return true;
    }
    // `all` takes no argument at all.
    if t.kind == TermKind::All {
        return false;
    }
    if t.kind == TermKind::Include && t.value.is_empty() {
        return false;
    }
    if t.kind.is_modifier() && delimiter != '=' {
        return false;
    }
    if t.kind.is_mechanism() && delimiter != ':' {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(kind: TermKind, q: Qualifier, key: &str, value: &str) -> Token {
        Token {
            kind,
            qualifier: q,
            key: key.into(),
            value: value.into(),
        }
    }

    fn err(value: &str) -> Token {
        tok(TermKind::Err, Qualifier::Err, "", value)
    }

    #[test]
    fn scan_single_terms() {
        let cases: Vec<(&str, Token)> = vec![
            ("v=spf1", tok(TermKind::Version, Qualifier::Plus, "v", "spf1")),
            ("A:127.0.0.1", tok(TermKind::A, Qualifier::Plus, "A", "127.0.0.1")),
            ("a:127.0.0.1", tok(TermKind::A, Qualifier::Plus, "a", "127.0.0.1")),
            ("a", tok(TermKind::A, Qualifier::Plus, "", "")),
            ("?a:127.0.0.1", tok(TermKind::A, Qualifier::Question, "a", "127.0.0.1")),
            ("?ip6:2001::43", tok(TermKind::Ip6, Qualifier::Question, "ip6", "2001::43")),
            ("+ip6:::1", tok(TermKind::Ip6, Qualifier::Plus, "ip6", "::1")),
            ("^ip6:2001::4", err("^ip6:2001::4")),
            ("-all", tok(TermKind::All, Qualifier::Minus, "", "")),
            ("-mx:localhost", tok(TermKind::Mx, Qualifier::Minus, "mx", "localhost")),
            ("mx", tok(TermKind::Mx, Qualifier::Plus, "", "")),
            ("a:", err("a:")),
            ("?random:localhost", err("?random:localhost")),
            ("-:localhost", err("-:localhost")),
            ("qowie", err("qowie")),
            ("~+all", err("~+all")),
            ("-~all", err("-~all")),
            ("mx/24", tok(TermKind::Mx, Qualifier::Plus, "mx", "/24")),
            ("~mx/24", tok(TermKind::Mx, Qualifier::Tilde, "mx", "/24")),
            ("a/24", tok(TermKind::A, Qualifier::Plus, "a", "/24")),
            ("~a/24", tok(TermKind::A, Qualifier::Tilde, "a", "/24")),
        ];
        for (input, want) in cases {
            assert_eq!(scan_term(input), want, "input: {input}");
        }
    }

    #[test]
    fn lex_full_records() {
        let version = tok(TermKind::Version, Qualifier::Plus, "v", "spf1");

        assert_eq!(
            lex("v=spf1 a:127.0.0.1"),
            vec![version.clone(), tok(TermKind::A, Qualifier::Plus, "a", "127.0.0.1")]
        );
        assert_eq!(
            lex("v=spf1 ip4:127.0.0.1 -all"),
            vec![
                version.clone(),
                tok(TermKind::Ip4, Qualifier::Plus, "ip4", "127.0.0.1"),
                tok(TermKind::All, Qualifier::Minus, "", ""),
            ]
        );
        assert_eq!(
            lex("v=spf1  -ptr:arpa.1.0.0.127   -all  "),
            vec![
                version.clone(),
                tok(TermKind::Ptr, Qualifier::Minus, "ptr", "arpa.1.0.0.127"),
                tok(TermKind::All, Qualifier::Minus, "", ""),
            ]
        );
        assert_eq!(
            lex("v=spf1  exists:%{ir}.%{l1r+-}._spf.%{d} +all"),
            vec![
                version.clone(),
                tok(
                    TermKind::Exists,
                    Qualifier::Plus,
                    "exists",
                    "%{ir}.%{l1r+-}._spf.%{d}"
                ),
                tok(TermKind::All, Qualifier::Plus, "", ""),
            ]
        );
        assert_eq!(
            lex("v=spf1  redirect=_spf.example.org"),
            vec![
                version.clone(),
                tok(TermKind::Redirect, Qualifier::Plus, "redirect", "_spf.example.org"),
            ]
        );
        assert_eq!(
            lex("v=spf1 mx -all exp=explain._spf.%{d}"),
            vec![
                version,
                tok(TermKind::Mx, Qualifier::Plus, "", ""),
                tok(TermKind::All, Qualifier::Minus, "", ""),
                tok(TermKind::Exp, Qualifier::Plus, "exp", "explain._spf.%{d}"),
            ]
        );
    }

    #[test]
    fn known_name_with_wrong_delimiter_is_err() {
        // A mechanism spelled like a modifier is not rescued.
        assert_eq!(scan_term("include=example.org"), err("include=example.org"));
        assert_eq!(scan_term("all:x"), err("all:x"));
        assert_eq!(scan_term("all=x"), err("all=x"));
    }

    #[test]
    fn unknown_modifier_rescue() {
        let t = scan_term("foo=bar");
        assert_eq!(t.kind, TermKind::UnknownModifier);
        assert_eq!(t.qualifier, Qualifier::Plus);
        assert_eq!(t.key, "foo");
        assert_eq!(t.value, "bar");

        let t = scan_term("exp.text=%{i}%_rejected");
        assert_eq!(t.kind, TermKind::UnknownModifier);
        assert_eq!(t.key, "exp.text");
    }

    #[test]
    fn unknown_modifier_requires_valid_macro_string(){
        // A stray '%' fails the macro-string shape.
        assert_eq!(scan_term("foo=%bar"), err("foo=%bar"));
    }

    #[test]
    fn first_token_is_version_or_err() {
        for record in [
            "v=spf1 -all",
            "v=spf2 -all",
            "bogus stuff here",
            "v=spf1",
        ] {
            let tokens = lex(record);
            let first = &tokens[0];
            assert!(
                first.kind == TermKind::Version || first.kind == TermKind::Err,
                "record {record:?} began with {:?}",
                first.kind
            );
        }
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(lex("").is_empty());
        assert!(lex("   ").is_empty());
    }
}
