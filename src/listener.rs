//! Tracing sink for evaluation events.

use std::net::IpAddr;

use tracing::debug;

use crate::dns::ResponseExtras;
use crate::error::SpfError;
use crate::result::SpfResult;

/// Receives evaluation events in evaluation order. All callbacks are
/// synchronous and fire on the evaluation task; implementations should be
/// cheap or hand off internally.
///
/// Every method has a no-op default, so implementors subscribe only to
/// what they need.
#[allow(unused_variables)]
pub trait Listener: Send + Sync {
    /// A check_host frame was entered (once per include/redirect descent).
    fn check_host(&self, ip: IpAddr, domain: &str, sender: &str) {}

    /// The matching frame returned.
    fn check_host_result(
        &self,
        result: SpfResult,
        explanation: &str,
        extras: Option<&ResponseExtras>,
        err: Option<&SpfError>,
    ) {
    }

    /// A policy was chosen for the current frame.
    fn spf_record(&self, record: &str) {}

    /// TXT records were filtered: near-miss candidates and strict policies.
    fn txt(&self, candidates: &[String], policies: &[String]) {}

    /// A directive is being evaluated, or reported as unused (skipped
    /// after an early match, or a redirect shadowed by `all`).
    /// `effective_value` is the macro-expanded, normalized target when one
    /// was computed.
    fn directive(
        &self,
        unused: bool,
        qualifier: &str,
        mechanism: &str,
        key: &str,
        value: &str,
        effective_value: &str,
    ) {
    }

    /// A resolved address is being tested against a CIDR.
    #[allow(clippy::too_many_arguments)]
    fn matching_ip(
        &self,
        qualifier: &str,
        mechanism: &str,
        value: &str,
        fqdn: &str,
        network: IpAddr,
        prefix: u8,
        host: &str,
        client_ip: IpAddr,
    ) {
    }

    /// A DNS call for a directive completed.
    fn lookup_extras(
        &self,
        qualifier: &str,
        mechanism: &str,
        value: &str,
        fqdn: &str,
        extras: Option<&ResponseExtras>,
    ) {
    }

    /// A directive matched and decides the result.
    fn on_match(
        &self,
        qualifier: &str,
        mechanism: &str,
        value: &str,
        result: SpfResult,
        explanation: &str,
        err: Option<&SpfError>,
    ) {
    }

    /// A directive did not match.
    fn on_non_match(
        &self,
        qualifier: &str,
        mechanism: &str,
        value: &str,
        result: SpfResult,
        err: Option<&SpfError>,
    ) {
    }

    /// Observe mode only: the directive that would have decided the
    /// result, fired once per frame.
    fn first_match(&self, result: SpfResult, err: Option<&SpfError>) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl Listener for NoopListener {}

/// Emits every event as a `tracing` debug record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceListener;

impl Listener for TraceListener {
    fn check_host(&self, ip: IpAddr, domain: &str, sender: &str) {
        debug!("CHECK_HOST({}, {:?}, {:?})", ip, domain, sender);
    }

    fn check_host_result(
        &self,
        result: SpfResult,
        explanation: &str,
        _extras: Option<&ResponseExtras>,
        err: Option<&SpfError>,
    ) {
        debug!(
            "= {}, {:?}, {}",
            result,
            explanation,
            err.map_or_else(|| "no error".to_string(), |e| e.to_string())
        );
    }

    fn spf_record(&self, record: &str) {
        debug!("SPF: {}", record);
    }

    fn txt(&self, candidates: &[String], policies: &[String]) {
        debug!("TXT: {} candidate(s), {} policy(ies)", candidates.len(), policies.len());
    }

    fn directive(
        &self,
        unused: bool,
        qualifier: &str,
        mechanism: &str,
        _key: &str,
        value: &str,
        effective_value: &str,
    ) {
        let q = if qualifier == "+" { "" } else { qualifier };
        debug!(
            "{}{}{}{}{} -> {}",
            if unused { "unused: " } else { "" },
            q,
            mechanism,
            if value.is_empty() { "" } else { ":" },
            value,
            effective_value,
        );
    }

    fn on_match(
        &self,
        qualifier: &str,
        mechanism: &str,
        value: &str,
        result: SpfResult,
        explanation: &str,
        _err: Option<&SpfError>,
    ) {
        debug!(
            "MATCH {}{}:{} => {} {:?}",
            qualifier, mechanism, value, result, explanation
        );
    }

    fn first_match(&self, result: SpfResult, _err: Option<&SpfError>) {
        debug!("FIRST-MATCH => {}", result);
    }
}
