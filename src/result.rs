//! SPF evaluation results (RFC 7208 Section 2.6).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// Result of an SPF evaluation as defined by RFC 7208 Section 2.6.
///
/// The first seven variants are wire-visible; [`SpfResult::Unreliable`] and
/// [`SpfResult::InternalError`] only appear inside the engine (the former
/// when observe mode is enabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpfResult {
    /// No syntactically valid domain was extracted from the SMTP session,
    /// or no SPF record was retrieved from the DNS.
    None = 1,
    /// The ADMD explicitly states that it is not asserting whether the IP
    /// address is authorized.
    Neutral = 2,
    /// Explicit statement that the client is authorized.
    Pass = 3,
    /// Explicit statement that the client is not authorized.
    Fail = 4,
    /// Weak statement that the host is probably not authorized.
    Softfail = 5,
    /// Transient (generally DNS) error while performing the check.
    Temperror = 6,
    /// The domain's published records could not be correctly interpreted.
    Permerror = 7,
    /// Replaces any other result when ignore-matches (observe mode) is on.
    Unreliable = 8,
    /// Should never escape the engine.
    InternalError = 9,
}

impl SpfResult {
    /// Canonical lowercase form per RFC 7208 Section 2.6. Engine-internal
    /// variants render as their numeric tag.
    pub fn as_str(self) -> &'static str {
        match self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::Softfail => "softfail",
            SpfResult::Temperror => "temperror",
            SpfResult::Permerror => "permerror",
            SpfResult::Unreliable => "8",
            SpfResult::InternalError => "9",
        }
    }

    fn from_int(n: u8) -> Option<Self> {
        Some(match n {
            1 => SpfResult::None,
            2 => SpfResult::Neutral,
            3 => SpfResult::Pass,
            4 => SpfResult::Fail,
            5 => SpfResult::Softfail,
            6 => SpfResult::Temperror,
            7 => SpfResult::Permerror,
            8 => SpfResult::Unreliable,
            9 => SpfResult::InternalError,
            _ => return None,
        })
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpfResult {
    type Err = String;

    /// Accepts the canonical name or a stringified integer tag, for
    /// forward-compatibility with older cache dumps.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SpfResult::None),
            "neutral" => Ok(SpfResult::Neutral),
            "pass" => Ok(SpfResult::Pass),
            "fail" => Ok(SpfResult::Fail),
            "softfail" => Ok(SpfResult::Softfail),
            "temperror" => Ok(SpfResult::Temperror),
            "permerror" => Ok(SpfResult::Permerror),
            other => other
                .parse::<u8>()
                .ok()
                .and_then(SpfResult::from_int)
                .ok_or_else(|| format!("unknown SPF result: {other}")),
        }
    }
}

impl Serialize for SpfResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SpfResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strings() {
        assert_eq!(SpfResult::Pass.to_string(), "pass");
        assert_eq!(SpfResult::Softfail.to_string(), "softfail");
        assert_eq!(SpfResult::Permerror.to_string(), "permerror");
    }

    #[test]
    fn parse_names() {
        assert_eq!("pass".parse::<SpfResult>().unwrap(), SpfResult::Pass);
        assert_eq!("none".parse::<SpfResult>().unwrap(), SpfResult::None);
        assert_eq!(
            "temperror".parse::<SpfResult>().unwrap(),
            SpfResult::Temperror
        );
    }

    #[test]
    fn parse_stringified_integers() {
        assert_eq!("3".parse::<SpfResult>().unwrap(), SpfResult::Pass);
        assert_eq!("7".parse::<SpfResult>().unwrap(), SpfResult::Permerror);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!("bogus".parse::<SpfResult>().is_err());
        assert!("0".parse::<SpfResult>().is_err());
        assert!("10".parse::<SpfResult>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&SpfResult::Fail).unwrap();
        assert_eq!(json, "\"fail\"");
        let back: SpfResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SpfResult::Fail);
    }
}
