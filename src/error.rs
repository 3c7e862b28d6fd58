//! Error taxonomy: every failure carries an [`ErrorKind`] so downstream
//! systems can triage without string parsing, and evaluation frames wrap
//! errors with the directive token that produced them.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

use crate::token::Token;

/// Coarse error class, for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorKind {
    #[default]
    Unknown = 0,
    Syntax = 1,
    Validation = 2,
    Dns = 3,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Validation => "validation",
            ErrorKind::Dns => "dns",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(ErrorKind::Unknown),
            "syntax" => Ok(ErrorKind::Syntax),
            "validation" => Ok(ErrorKind::Validation),
            "dns" => Ok(ErrorKind::Dns),
            other => match other.parse::<u8>() {
                Ok(0) => Ok(ErrorKind::Unknown),
                Ok(1) => Ok(ErrorKind::Syntax),
                Ok(2) => Ok(ErrorKind::Validation),
                Ok(3) => Ok(ErrorKind::Dns),
                _ => Err(format!("unknown error kind: {other}")),
            },
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Everything that can go wrong during an SPF evaluation.
///
/// The [`SpfError::Directive`] variant chains errors through the recursion:
/// each frame that surfaces an error wraps it with its current directive
/// token, so the final error reconstructs the directive stack. Use
/// [`SpfError::cause`] for the bottom of the chain and
/// [`SpfError::token`] for the top.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpfError {
    #[error("temporary DNS error")]
    DnsTemperror,
    /// NXDOMAIN (RCODE 3).
    #[error("permanent DNS error")]
    DnsPermerror,
    /// More than `lookup_limit` DNS-lookup-causing terms.
    #[error("limit exceeded")]
    DnsLimitExceeded,
    /// More than `void_lookup_limit` void lookups.
    #[error("void lookup limit exceeded")]
    DnsVoidLookupLimitExceeded,
    #[error("SPF record not found")]
    SpfNotFound,
    #[error("too many SPF records")]
    TooManySpfRecords,
    #[error(r#"too many "redirect""#)]
    TooManyRedirects,
    #[error(r#"too many "exp""#)]
    TooManyExps,
    /// A term the lexer rejected.
    #[error("wrong syntax")]
    WrongSyntax,
    #[error("empty domain")]
    EmptyDomain,
    #[error("address isn't ipv4")]
    NotIpv4,
    #[error("address isn't ipv6")]
    NotIpv6,
    #[error("invalid CIDR length")]
    InvalidCidrLength,
    #[error("infinite recursion detected")]
    LoopDetected,
    #[error("result is unreliable with ignore-matches enabled")]
    UnreliableResult,
    #[error("too many errors")]
    TooManyErrors,
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),
    #[error("macro values missing: {}: {domain}", .macros.join(", "))]
    MissingMacros { domain: String, macros: Vec<String> },
    #[error("wrong macro syntax: {0}")]
    MacroSyntax(String),
    /// An error attributed to the directive that produced it.
    #[error(r#"error checking "{token}": {source}"#)]
    Directive {
        token: Box<Token>,
        source: Box<SpfError>,
    },
}

impl SpfError {
    /// Wrap `source` with the directive token that produced it.
    pub fn in_directive(token: &Token, source: SpfError) -> SpfError {
        SpfError::Directive {
            token: Box::new(token.clone()),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SpfError::DnsTemperror
            | SpfError::DnsPermerror
            | SpfError::DnsLimitExceeded
            | SpfError::DnsVoidLookupLimitExceeded => ErrorKind::Dns,
            SpfError::SpfNotFound
            | SpfError::TooManySpfRecords
            | SpfError::TooManyRedirects
            | SpfError::TooManyExps
            | SpfError::LoopDetected
            | SpfError::MissingMacros { .. } => ErrorKind::Validation,
            SpfError::WrongSyntax
            | SpfError::EmptyDomain
            | SpfError::NotIpv4
            | SpfError::NotIpv6
            | SpfError::InvalidCidrLength
            | SpfError::InvalidDomain(_)
            | SpfError::MacroSyntax(_) => ErrorKind::Syntax,
            SpfError::UnreliableResult | SpfError::TooManyErrors => ErrorKind::Unknown,
            SpfError::Directive { source, .. } => source.kind(),
        }
    }

    /// The token at the top of the chain, if any.
    pub fn token(&self) -> Option<&Token> {
        match self {
            SpfError::Directive { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Walks the chain, returning the bottom-most attributed token and the
    /// root error.
    pub fn cause(&self) -> (Option<&Token>, &SpfError) {
        let mut token = None;
        let mut err = self;
        while let SpfError::Directive { token: t, source } = err {
            token = Some(t.as_ref());
            err = source;
        }
        (token, err)
    }

    /// The root error at the bottom of the chain.
    pub fn root(&self) -> &SpfError {
        self.cause().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Qualifier, TermKind};

    fn include_token(value: &str) -> Token {
        Token {
            kind: TermKind::Include,
            qualifier: Qualifier::Plus,
            key: "include".into(),
            value: value.into(),
        }
    }

    #[test]
    fn kinds() {
        assert_eq!(SpfError::DnsTemperror.kind(), ErrorKind::Dns);
        assert_eq!(SpfError::LoopDetected.kind(), ErrorKind::Validation);
        assert_eq!(SpfError::EmptyDomain.kind(), ErrorKind::Syntax);
        assert_eq!(SpfError::TooManyErrors.kind(), ErrorKind::Unknown);
        assert_eq!(
            SpfError::InvalidDomain("x..y".into()).kind(),
            ErrorKind::Syntax
        );
    }

    #[test]
    fn chain_walk() {
        let inner = include_token("ab.example.com");
        let outer = include_token("ba.example.com");
        let err = SpfError::in_directive(
            &outer,
            SpfError::in_directive(&inner, SpfError::LoopDetected),
        );

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.token().unwrap().value, "ba.example.com");

        let (token, root) = err.cause();
        assert_eq!(token.unwrap().value, "ab.example.com");
        assert_eq!(*root, SpfError::LoopDetected);
    }

    #[test]
    fn chain_display() {
        let err = SpfError::in_directive(&include_token("b.example.com"), SpfError::LoopDetected);
        assert_eq!(
            err.to_string(),
            r#"error checking "include:b.example.com": infinite recursion detected"#
        );
    }

    #[test]
    fn kind_text_codec() {
        assert_eq!(ErrorKind::Dns.to_string(), "dns");
        assert_eq!("validation".parse::<ErrorKind>().unwrap(), ErrorKind::Validation);
        assert_eq!("2".parse::<ErrorKind>().unwrap(), ErrorKind::Validation);
        assert!("nope".parse::<ErrorKind>().is_err());
    }
}
