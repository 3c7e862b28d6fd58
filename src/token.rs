//! Typed representation of a single SPF term.

use std::fmt;

/// Kind of an SPF term: mechanisms, modifiers, and the lexer's sentinel
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermKind {
    /// End of record; never emitted by [`crate::lexer::lex`].
    Eof,
    /// A term the lexer could not make sense of.
    Err,
    /// The `v=spf1` starter.
    Version,
    All,
    A,
    Ip4,
    Ip6,
    Mx,
    Ptr,
    Include,
    Exists,
    Redirect,
    Exp,
    /// A `name=macro-string` modifier this implementation does not know.
    /// Ignored at evaluation but surfaced to the listener.
    UnknownModifier,
}

impl TermKind {
    /// Case-insensitive lookup of a term name. Unknown names map to
    /// [`TermKind::Err`]; the lexer may later rescue them as unknown
    /// modifiers.
    pub(crate) fn from_name(s: &str) -> TermKind {
        match s.to_ascii_lowercase().as_str() {
            "v" => TermKind::Version,
            "all" => TermKind::All,
            "a" => TermKind::A,
            "ip4" => TermKind::Ip4,
            "ip6" => TermKind::Ip6,
            "mx" => TermKind::Mx,
            "ptr" => TermKind::Ptr,
            "include" => TermKind::Include,
            "exists" => TermKind::Exists,
            "redirect" => TermKind::Redirect,
            "exp" | "explanation" => TermKind::Exp,
            _ => TermKind::Err,
        }
    }

    /// Mechanisms can match and dictate a result.
    pub fn is_mechanism(self) -> bool {
        matches!(
            self,
            TermKind::Version
                | TermKind::All
                | TermKind::A
                | TermKind::Ip4
                | TermKind::Ip6
                | TermKind::Mx
                | TermKind::Ptr
                | TermKind::Include
                | TermKind::Exists
        )
    }

    /// Modifiers never match; they steer evaluation.
    pub fn is_modifier(self) -> bool {
        matches!(
            self,
            TermKind::Redirect | TermKind::Exp | TermKind::UnknownModifier
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TermKind::Version => "v",
            TermKind::All => "all",
            TermKind::A => "a",
            TermKind::Ip4 => "ip4",
            TermKind::Ip6 => "ip6",
            TermKind::Mx => "mx",
            TermKind::Ptr => "ptr",
            TermKind::Include => "include",
            TermKind::Exists => "exists",
            TermKind::Redirect => "redirect",
            TermKind::Exp => "exp",
            TermKind::UnknownModifier => ":?",
            TermKind::Eof => ":eof",
            TermKind::Err => ":err",
        }
    }
}

impl fmt::Display for TermKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualifier prefix on a directive (RFC 7208 Section 4.6.2). Absence
/// defaults to `+`; two qualifiers in a row produce [`Qualifier::Err`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Plus,
    Minus,
    Tilde,
    Question,
    Err,
}

impl Qualifier {
    pub(crate) fn from_char(c: char) -> Option<Qualifier> {
        match c {
            '+' => Some(Qualifier::Plus),
            '-' => Some(Qualifier::Minus),
            '~' => Some(Qualifier::Tilde),
            '?' => Some(Qualifier::Question),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Qualifier::Plus => "+",
            Qualifier::Minus => "-",
            Qualifier::Tilde => "~",
            Qualifier::Question => "?",
            Qualifier::Err => ":err",
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single SPF term as produced by the lexer.
///
/// `key` preserves the name exactly as written, which matters for unknown
/// modifiers; `value` is the body after `:` or `=`, or from the `/` for the
/// dual-CIDR shortcut on `a`/`mx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TermKind,
    pub qualifier: Qualifier,
    pub key: String,
    pub value: String,
}

impl Token {
    pub(crate) fn new(kind: TermKind, qualifier: Qualifier) -> Token {
        Token {
            kind,
            qualifier,
            key: String::new(),
            value: String::new(),
        }
    }

    /// True iff the lexer rejected this term.
    pub fn is_err(&self) -> bool {
        self.kind == TermKind::Err || self.qualifier == Qualifier::Err
    }
}

impl fmt::Display for Token {
    /// Reproduces the original directive text: `+` is elided, `:` vs `=`
    /// follows mechanism vs modifier, and dual-CIDR bodies (which begin
    /// with `/`) are appended verbatim.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_err() {
            return f.write_str(&self.value);
        }
        if self.qualifier != Qualifier::Plus {
            f.write_str(self.qualifier.as_str())?;
        }
        let key = if self.kind == TermKind::UnknownModifier {
            self.key.as_str()
        } else {
            self.kind.as_str()
        };
        f.write_str(key)?;
        if self.value.is_empty() {
            return Ok(());
        }
        if !self.value.starts_with('/') {
            let delim = if self.kind == TermKind::Version || self.kind.is_modifier() {
                "="
            } else {
                ":"
            };
            f.write_str(delim)?;
        }
        f.write_str(&self.value)
    }
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

    #[test]
    fn display_elides_plus() {
        let t = tok(TermKind::All, Qualifier::Plus, "all", "");
        assert_eq!(t.to_string(), "all");
    }

    #[test]
    fn display_keeps_other_qualifiers() {
        let t = tok(TermKind::All, Qualifier::Minus, "all", "");
        assert_eq!(t.to_string(), "-all");
        let t = tok(TermKind::All, Qualifier::Tilde, "all", "");
        assert_eq!(t.to_string(), "~all");
    }

    #[test]
    fn display_mechanism_colon() {
        let t = tok(TermKind::Include, Qualifier::Plus, "include", "example.com");
        assert_eq!(t.to_string(), "include:example.com");
    }

    #[test]
    fn display_modifier_equals() {
        let t = tok(TermKind::Redirect, Qualifier::Plus, "redirect", "example.com");
        assert_eq!(t.to_string(), "redirect=example.com");
        let t = tok(TermKind::Version, Qualifier::Plus, "v", "spf1");
        assert_eq!(t.to_string(), "v=spf1");
    }

    #[test]
    fn display_dual_cidr_verbatim() {
        let t = tok(TermKind::Mx, Qualifier::Minus, "mx", "/24/64");
        assert_eq!(t.to_string(), "-mx/24/64");
    }

    #[test]
    fn display_unknown_modifier_preserves_key() {
        let t = tok(TermKind::UnknownModifier, Qualifier::Plus, "MoO", "cow");
        assert_eq!(t.to_string(), "MoO=cow");
    }

    #[test]
    fn display_err_token_is_raw_value() {
        let t = tok(TermKind::Err, Qualifier::Err, "", "--all");
        assert_eq!(t.to_string(), "--all");
    }

    #[test]
    fn mechanism_and_modifier_classification() {
        assert!(TermKind::A.is_mechanism());
        assert!(TermKind::Version.is_mechanism());
        assert!(!TermKind::Redirect.is_mechanism());
        assert!(TermKind::Redirect.is_modifier());
        assert!(TermKind::UnknownModifier.is_modifier());
        assert!(!TermKind::Err.is_mechanism());
        assert!(!TermKind::Err.is_modifier());
    }
}
