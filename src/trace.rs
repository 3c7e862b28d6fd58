//! `Received-SPF` header synthesis (RFC 7208 Section 9.1).

use std::fmt::Write as _;
use std::net::IpAddr;

use serde::Serialize;

use crate::result::SpfResult;

/// Everything a verifier records about one evaluation, shaped for the
/// `Received-SPF` header field.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub result: SpfResult,
    #[serde(rename = "exp", skip_serializing_if = "String::is_empty")]
    pub explanation: String,
    #[serde(rename = "clientIp", skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// The identity that was checked (`mailfrom` or `helo`).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identity: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub helo: String,
    #[serde(rename = "envelopeFrom", skip_serializing_if = "String::is_empty")]
    pub envelope_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    /// The mechanism that matched.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mechanism: String,
}

impl Trace {
    pub fn new(result: SpfResult) -> Trace {
        Trace {
            result,
            explanation: String::new(),
            client_ip: None,
            identity: String::new(),
            helo: String::new(),
            envelope_from: String::new(),
            problem: None,
            receiver: String::new(),
            mechanism: String::new(),
        }
    }

    /// Renders the `Received-SPF` header value.
    pub fn received_spf(&self) -> String {
        let mut b = String::new();
        b.push_str(self.result.as_str());
        self.write_comment(&mut b);

        let mut sep = false;
        if let Some(ip) = self.client_ip {
            sep = write_kv(&mut b, sep, "client-ip", &ip.to_string());
        }
        if let Some(problem) = &self.problem {
            sep = write_kv(&mut b, sep, "problem", problem);
        }
        sep = write_kv(&mut b, sep, "identity", &self.identity);
        sep = write_kv(&mut b, sep, "helo", &self.helo);
        sep = write_kv(&mut b, sep, "envelope-from", &self.envelope_from);
        sep = write_kv(&mut b, sep, "receiver", &self.receiver);
        write_kv(&mut b, sep, "mechanism", &self.mechanism);
        b
    }

    fn write_comment(&self, b: &mut String) {
        b.push_str(" (");
        if !self.explanation.is_empty() {
            b.push_str(&self.explanation);
            b.push(')');
            return;
        }
        if !self.receiver.is_empty() {
            b.push_str(&self.receiver);
            b.push_str(": ");
        }
        let sender = if self.envelope_from.is_empty() {
            "sender"
        } else {
            &self.envelope_from
        };
        let host = self
            .client_ip
            .map_or_else(|| "the host".to_string(), |ip| ip.to_string());
        match self.result {
            SpfResult::Pass => {
                let _ = write!(b, "domain of {sender} designates {host} as permitted sender");
            }
            SpfResult::Fail => {
                let _ = write!(
                    b,
                    "domain of {sender} does not designate {host} as permitted sender"
                );
            }
            SpfResult::Softfail => {
                let _ = write!(
                    b,
                    "domain of {sender} does not designate {host} as permitted sender but is in transition"
                );
            }
            SpfResult::Neutral => b.push_str("nothing can be said about validity"),
            SpfResult::None => {
                let _ = write!(
                    b,
                    "domain of {sender} does not have an SPF record or the SPF record does not evaluate to a result"
                );
            }
            SpfResult::Permerror => b.push_str("a permanent error has occured"),
            SpfResult::Temperror => b.push_str("a transient error has occured"),
            SpfResult::Unreliable | SpfResult::InternalError => {}
        }
        b.push(')');
    }
}

fn write_kv(b: &mut String, sep: bool, key: &str, value: &str) -> bool {
    if value.is_empty() {
        return sep;
    }
    if sep {
        b.push(';');
    }
    b.push(' ');
    b.push_str(key);
    b.push('=');
    b.push_str(value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_header() {
        let mut t = Trace::new(SpfResult::Pass);
        t.client_ip = Some("192.0.2.1".parse().unwrap());
        t.envelope_from = "myname@example.com".into();
        t.helo = "foo.example.com".into();
        t.receiver = "mybox.example.org".into();
        assert_eq!(
            t.received_spf(),
            "pass (mybox.example.org: domain of myname@example.com designates 192.0.2.1 \
             as permitted sender) client-ip=192.0.2.1; helo=foo.example.com; \
             envelope-from=myname@example.com; receiver=mybox.example.org"
        );
    }

    #[test]
    fn explanation_replaces_comment() {
        let mut t = Trace::new(SpfResult::Fail);
        t.explanation = "ask postmaster@example.com".into();
        assert_eq!(t.received_spf(), "fail (ask postmaster@example.com)");
    }

    #[test]
    fn neutral_comment() {
        let t = Trace::new(SpfResult::Neutral);
        assert_eq!(t.received_spf(), "neutral (nothing can be said about validity)");
    }

    #[test]
    fn problem_is_reported() {
        let mut t = Trace::new(SpfResult::Temperror);
        t.problem = Some("temporary DNS error".into());
        assert_eq!(
            t.received_spf(),
            "temperror (a transient error has occured) problem=temporary DNS error"
        );
    }

    #[test]
    fn serializes_without_empty_fields() {
        let t = Trace::new(SpfResult::Pass);
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"result":"pass"}"#);
    }
}
