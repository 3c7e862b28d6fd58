//! The check_host engine: policy fetch, directive iteration, recursive
//! include/redirect descent, and observe ("walker") mode.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use crate::dns::{HickoryResolver, LimitedResolver, Resolver, ResponseExtras};
use crate::error::SpfError;
use crate::filter::{classify_txt, select_policy};
use crate::fqdn::{is_domain_name, normalize_fqdn, truncate_fqdn};
use crate::lexer::lex;
use crate::listener::{Listener, NoopListener};
use crate::macros::{expand, Expansion, MacroContext};
use crate::result::SpfResult;
use crate::token::{Qualifier, TermKind, Token};

pub const DEFAULT_LOOKUP_LIMIT: u16 = 10;
pub const DEFAULT_MX_QUERIES_LIMIT: u16 = 10;
pub const DEFAULT_VOID_LOOKUP_LIMIT: u16 = 2;

/// Outcome of a check_host evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: SpfResult,
    /// Expanded `exp=` text, when the result is Fail and the policy
    /// carried one.
    pub explanation: String,
    /// The `v=spf1` record actually consulted; empty if none was chosen.
    pub policy: String,
    /// The reason for the encountered problem, chained through the
    /// directives that produced it.
    pub error: Option<SpfError>,
}

/// Evaluates SPF policies per RFC 7208 against a pluggable resolver.
///
/// Each [`Verifier::check_host`] call arms fresh lookup budgets around the
/// injected resolver, so one verifier can serve many messages.
pub struct Verifier<R, L = NoopListener> {
    resolver: R,
    listener: L,
    helo_domain: String,
    receiving_fqdn: String,
    evaluated_on: Option<SystemTime>,
    ignore_matches: bool,
    partial_macros: bool,
    errors_threshold: Option<u32>,
    lookup_limit: u16,
    mx_queries_limit: u16,
    void_lookup_limit: u16,
}

impl<R: Resolver> Verifier<R, NoopListener> {
    pub fn new(resolver: R) -> Verifier<R, NoopListener> {
        Verifier {
            resolver,
            listener: NoopListener,
            helo_domain: String::new(),
            receiving_fqdn: String::new(),
            evaluated_on: None,
            ignore_matches: false,
            partial_macros: false,
            errors_threshold: None,
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
            mx_queries_limit: DEFAULT_MX_QUERIES_LIMIT,
            void_lookup_limit: DEFAULT_VOID_LOOKUP_LIMIT,
        }
    }
}

impl<R: Resolver, L: Listener> Verifier<R, L> {
    /// Inject a tracing sink.
    pub fn listener<L2: Listener>(self, listener: L2) -> Verifier<R, L2> {
        Verifier {
            resolver: self.resolver,
            listener,
            helo_domain: self.helo_domain,
            receiving_fqdn: self.receiving_fqdn,
            evaluated_on: self.evaluated_on,
            ignore_matches: self.ignore_matches,
            partial_macros: self.partial_macros,
            errors_threshold: self.errors_threshold,
            lookup_limit: self.lookup_limit,
            mx_queries_limit: self.mx_queries_limit,
            void_lookup_limit: self.void_lookup_limit,
        }
    }

    /// Value for `%{h}`. Ignored unless it is a well-formed domain.
    pub fn helo_domain(mut self, s: &str) -> Self {
        if is_domain_name(s) {
            self.helo_domain = s.to_string();
        }
        self
    }

    /// Value for `%{r}`. Ignored unless it is a well-formed domain.
    pub fn receiving_fqdn(mut self, s: &str) -> Self {
        if is_domain_name(s) {
            self.receiving_fqdn = s.to_string();
        }
        self
    }

    /// Pin the timestamp used by `%{t}`. Defaults to the wall clock at
    /// evaluation start.
    pub fn evaluated_on(mut self, t: SystemTime) -> Self {
        self.evaluated_on = Some(t);
        self
    }

    /// Observe mode: visit every directive without early exit and return
    /// [`SpfResult::Unreliable`].
    pub fn ignore_matches(mut self) -> Self {
        self.ignore_matches = true;
        self
    }

    /// Keep every macro but `%{d}` unexpanded (observe mode only; meant
    /// for static analysis).
    pub fn partial_macros(mut self, v: bool) -> Self {
        self.partial_macros = v;
        self
    }

    /// Observe mode only: stop with [`SpfError::TooManyErrors`] once `n`
    /// directive errors have been seen.
    pub fn errors_threshold(mut self, n: u32) -> Self {
        self.errors_threshold = Some(n);
        self
    }

    pub fn lookup_limit(mut self, n: u16) -> Self {
        self.lookup_limit = n;
        self
    }

    pub fn mx_queries_limit(mut self, n: u16) -> Self {
        self.mx_queries_limit = n;
        self
    }

    pub fn void_lookup_limit(mut self, n: u16) -> Self {
        self.void_lookup_limit = n;
        self
    }

    /// RFC 7208 check_host(): evaluates the SPF policy of `domain` for a
    /// client `ip` and `sender` identity.
    pub async fn check_host(&self, ip: IpAddr, domain: &str, sender: &str) -> Evaluation {
        debug!("check_host({}, {:?}, {:?})", ip, domain, sender);
        let session = Session {
            resolver: LimitedResolver::new(
                &self.resolver,
                self.lookup_limit,
                self.mx_queries_limit,
                self.void_lookup_limit,
            ),
            cfg: self,
            evaluated_on: self.evaluated_on.unwrap_or_else(SystemTime::now),
            visited: Mutex::new(Vec::new()),
            policy: Mutex::new(String::new()),
            gate: self.errors_threshold.map(ErrorGate::new),
        };
        let frame = Frame {
            session: &session,
            ip,
            domain: normalize_fqdn(domain),
            sender: sender.to_string(),
            extras: Mutex::new(None),
        };
        let (result, explanation, error) = frame.check_host().await;
        drop(frame);
        let policy = session.policy.into_inner().unwrap();
        Evaluation {
            result,
            explanation,
            policy,
            error,
        }
    }
}

/// Evaluates with the process-default resolver and budgets 10/10/2.
pub async fn check_host(ip: IpAddr, domain: &str, sender: &str) -> Evaluation {
    Verifier::new(HickoryResolver::new())
        .check_host(ip, domain, sender)
        .await
}

/// State shared by every frame of one evaluation.
struct Session<'v, R: Resolver, L: Listener> {
    resolver: LimitedResolver<&'v R>,
    cfg: &'v Verifier<R, L>,
    evaluated_on: SystemTime,
    /// Normalized domains currently being expanded; cycle detection.
    visited: Mutex<Vec<String>>,
    /// The outermost frame's selected policy.
    policy: Mutex<String>,
    gate: Option<ErrorGate>,
}

/// The observe-mode error counter built by `errors_threshold`.
struct ErrorGate {
    remaining: AtomicI64,
}

impl ErrorGate {
    fn new(n: u32) -> ErrorGate {
        ErrorGate {
            remaining: AtomicI64::new(i64::from(n)),
        }
    }

    fn should_stop(&self, err: Option<&SpfError>) -> bool {
        match err {
            None => self.remaining.load(Ordering::SeqCst) <= 0,
            Some(e) => match e.root() {
                SpfError::TooManyErrors => true,
                SpfError::UnreliableResult => self.remaining.load(Ordering::SeqCst) <= 0,
                _ => self.remaining.fetch_sub(1, Ordering::SeqCst) - 1 <= 0,
            },
        }
    }
}

/// Per-mechanism outcome: exactly one of match, non-match, or error is
/// produced; errors ride along with a match=true decision result.
type Decision = (bool, SpfResult, Option<SpfError>);

/// One check_host invocation (the outer call, or an include/redirect
/// descent).
struct Frame<'s, 'v, R: Resolver, L: Listener> {
    session: &'s Session<'v, R, L>,
    ip: IpAddr,
    /// Normalized evaluation domain.
    domain: String,
    sender: String,
    /// Minimum-TTL fold over this frame's DNS answers.
    extras: Mutex<Option<ResponseExtras>>,
}

impl<R: Resolver, L: Listener> Frame<'_, '_, R, L> {
    fn listener(&self) -> &L {
        &self.session.cfg.listener
    }

    fn walker(&self) -> bool {
        self.session.cfg.ignore_matches
    }

    fn note_extras(&self, extras: ResponseExtras) {
        let mut slot = self.extras.lock().unwrap();
        *slot = Some(match *slot {
            None => extras,
            Some(prev) => ResponseExtras {
                ttl: prev.ttl.min(extras.ttl),
                void: prev.void || extras.void,
            },
        });
    }

    fn macro_ctx(&self) -> MacroContext<'_> {
        MacroContext {
            sender: &self.sender,
            domain: &self.domain,
            ip: self.ip,
            helo_domain: &self.session.cfg.helo_domain,
            receiving_fqdn: &self.session.cfg.receiving_fqdn,
            evaluated_on: self.session.evaluated_on,
        }
    }

    fn expand_macros(&self, input: &str, exp: bool) -> Result<Expansion, SpfError> {
        expand(
            input,
            &self.macro_ctx(),
            exp,
            self.session.cfg.partial_macros,
        )
    }

    /// Shared domain-spec pipeline: macro-expand, truncate, validate,
    /// normalize. `strict_missing` turns empty macro values into a
    /// validation error (include/exists/redirect).
    fn resolve_target(&self, spec: &str, strict_missing: bool) -> Result<String, SpfError> {
        let expansion = self.expand_macros(spec, false)?;
        if strict_missing && !expansion.missing.is_empty() {
            return Err(SpfError::MissingMacros {
                domain: expansion.text,
                macros: expansion.missing,
            });
        }
        if self.session.cfg.partial_macros && expansion.text.contains('%') {
            // Partially expanded specs keep their macros and cannot pass
            // name validation; hand them through for observability.
            return Ok(expansion.text);
        }
        if expansion.text.is_empty() {
            return Err(SpfError::EmptyDomain);
        }
        let truncated = truncate_fqdn(&expansion.text)?;
        if !is_domain_name(&truncated) {
            return Err(SpfError::InvalidDomain(truncated));
        }
        Ok(normalize_fqdn(&truncated))
    }

    /// Target plus dual-CIDR masks for `a`/`mx`. An empty spec means the
    /// current domain; a spec starting with `/` is the dual-CIDR
    /// shortcut on the current domain.
    fn domain_dual_cidr(&self, t: &Token) -> Result<(String, u8, u8), SpfError> {
        let raw = if t.value.is_empty() {
            self.domain.clone()
        } else if t.value.starts_with('/') {
            format!("{}{}", self.domain, t.value)
        } else {
            t.value.clone()
        };
        let mut parts = raw.splitn(3, '/');
        let spec = parts.next().unwrap_or_default().to_string();
        let cidr4 = parse_cidr_len(parts.next(), 32)?;
        let cidr6 = parse_cidr_len(parts.next(), 128)?;
        let spec = if spec.is_empty() {
            self.domain.clone()
        } else {
            spec
        };
        let fqdn = self.resolve_target(&spec, false)?;
        Ok((fqdn, cidr4, cidr6))
    }

    fn fire_directive(&self, t: &Token, effective: &str, unused: bool) {
        self.listener().directive(
            unused,
            t.qualifier.as_str(),
            t.kind.as_str(),
            &t.key,
            &t.value,
            effective,
        );
    }

    fn fire_unused(&self, rest: &[Token], redirect: Option<&Token>) {
        for t in rest {
            self.fire_directive(t, "", true);
        }
        if let Some(t) = redirect {
            self.fire_directive(t, "", true);
        }
    }

    async fn check_host(&self) -> (SpfResult, String, Option<SpfError>) {
        self.listener().check_host(self.ip, &self.domain, &self.sender);
        let outcome = self.check_host_inner().await;
        self.listener().check_host_result(
            outcome.0,
            &outcome.1,
            self.extras.lock().unwrap().as_ref(),
            outcome.2.as_ref(),
        );
        outcome
    }

    async fn check_host_inner(&self) -> (SpfResult, String, Option<SpfError>) {
        // RFC 7208 Section 4.3: a malformed domain is None, immediately.
        if !is_domain_name(&self.domain) {
            return (
                SpfResult::None,
                String::new(),
                Some(SpfError::InvalidDomain(self.domain.clone())),
            );
        }
        {
            let mut visited = self.session.visited.lock().unwrap();
            if visited.iter().any(|d| *d == self.domain) {
                return (
                    SpfResult::Permerror,
                    String::new(),
                    Some(SpfError::LoopDetected),
                );
            }
            visited.push(self.domain.clone());
        }
        let outcome = self.fetch_and_evaluate().await;
        self.session.visited.lock().unwrap().pop();
        outcome
    }

    async fn fetch_and_evaluate(&self) -> (SpfResult, String, Option<SpfError>) {
        let txts = match self.session.resolver.lookup_txt_strict(&self.domain).await {
            Ok((txts, extras)) => {
                self.note_extras(extras);
                txts
            }
            Err(
                e @ (SpfError::DnsLimitExceeded | SpfError::DnsVoidLookupLimitExceeded),
            ) => return (SpfResult::Permerror, String::new(), Some(e)),
            Err(e @ SpfError::DnsPermerror) => return (SpfResult::None, String::new(), Some(e)),
            Err(e) => return (SpfResult::Temperror, String::new(), Some(e)),
        };

        let classes = classify_txt(&txts);
        self.listener().txt(&classes.candidates, &classes.policies);
        let policy = match select_policy(&classes) {
            Ok(p) => p.to_string(),
            Err(e @ SpfError::SpfNotFound) => return (SpfResult::None, String::new(), Some(e)),
            Err(e) => return (SpfResult::Permerror, String::new(), Some(e)),
        };

        if self.session.visited.lock().unwrap().len() == 1 {
            *self.session.policy.lock().unwrap() = policy.clone();
        }

        self.evaluate(&policy).await
    }

    async fn evaluate(&self, policy: &str) -> (SpfResult, String, Option<SpfError>) {
        self.listener().spf_record(policy);
        let sorted = match sort_tokens(lex(policy)) {
            Ok(s) => s,
            Err(e) => return (SpfResult::Permerror, String::new(), Some(e)),
        };
        for t in &sorted.unknown_modifiers {
            self.fire_directive(t, "", false);
        }

        let walker = self.walker();
        let mut first_match_fired = false;

        for i in 0..sorted.mechanisms.len() {
            let token = &sorted.mechanisms[i];
            let (matched, result, mut err) = self.eval_directive(token).await;

            if matched && !walker {
                let mut explanation = String::new();
                if result == SpfResult::Fail {
                    if let Some(exp) = &sorted.explanation {
                        match self.handle_explanation(exp).await {
                            Ok(s) => explanation = s,
                            Err(e) => err = Some(e),
                        }
                    }
                }
                self.listener().on_match(
                    token.qualifier.as_str(),
                    token.kind.as_str(),
                    &token.value,
                    result,
                    &explanation,
                    err.as_ref(),
                );
                self.fire_unused(&sorted.mechanisms[i + 1..], sorted.redirect.as_ref());
                return (result, explanation, err);
            }

            if matched {
                if !first_match_fired {
                    first_match_fired = true;
                    self.listener().first_match(result, err.as_ref());
                }
                self.listener().on_match(
                    token.qualifier.as_str(),
                    token.kind.as_str(),
                    &token.value,
                    result,
                    "",
                    err.as_ref(),
                );
            } else {
                self.listener().on_non_match(
                    token.qualifier.as_str(),
                    token.kind.as_str(),
                    &token.value,
                    result,
                    err.as_ref(),
                );
            }

            if walker {
                if let Some(gate) = &self.session.gate {
                    if gate.should_stop(err.as_ref()) {
                        return (
                            SpfResult::Unreliable,
                            String::new(),
                            Some(SpfError::TooManyErrors),
                        );
                    }
                }
            }
        }

        if let Some(redirect) = &sorted.redirect {
            if sorted.saw_all {
                // RFC 7208 Section 6.1: redirect is ignored when all is
                // present.
                self.fire_directive(redirect, "", true);
            } else if walker {
                let (_, _, err) = self.handle_redirect(redirect).await;
                if let Some(gate) = &self.session.gate {
                    if gate.should_stop(err.as_ref()) {
                        return (
                            SpfResult::Unreliable,
                            String::new(),
                            Some(SpfError::TooManyErrors),
                        );
                    }
                }
            } else {
                return self.handle_redirect(redirect).await;
            }
        }

        if walker {
            return (
                SpfResult::Unreliable,
                String::new(),
                Some(SpfError::UnreliableResult),
            );
        }
        (SpfResult::Neutral, String::new(), None)
    }

    async fn eval_directive(&self, t: &Token) -> Decision {
        match t.kind {
            TermKind::Version => self.eval_version(t),
            TermKind::All => self.eval_all(t),
            TermKind::Ip4 => self.eval_ip(t, false),
            TermKind::Ip6 => self.eval_ip(t, true),
            TermKind::A => self.eval_a_mx(t, false).await,
            TermKind::Mx => self.eval_a_mx(t, true).await,
            TermKind::Ptr => self.eval_ptr(t).await,
            TermKind::Include => self.eval_include(t).await,
            TermKind::Exists => self.eval_exists(t).await,
            _ => {
                self.fire_directive(t, "", false);
                (false, SpfResult::None, None)
            }
        }
    }

    fn eval_version(&self, t: &Token) -> Decision {
        self.fire_directive(t, "", false);
        if t.value == "spf1" {
            (false, SpfResult::None, None)
        } else {
            (
                true,
                SpfResult::Permerror,
                Some(SpfError::in_directive(t, SpfError::WrongSyntax)),
            )
        }
    }

    fn eval_all(&self, t: &Token) -> Decision {
        self.fire_directive(t, "", false);
        match qualifier_result(t.qualifier) {
            Ok(result) => (true, result, None),
            Err(e) => (
                true,
                SpfResult::Permerror,
                Some(SpfError::in_directive(t, e)),
            ),
        }
    }

    fn eval_ip(&self, t: &Token, v6: bool) -> Decision {
        self.fire_directive(t, &t.value, false);
        let result = match qualifier_result(t.qualifier) {
            Ok(r) => r,
            Err(e) => {
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
        };
        match parse_ip_value(&t.value, v6) {
            Ok((network, prefix)) => (ip_contains(self.ip, network, prefix), result, None),
            Err(e) => (
                true,
                SpfResult::Permerror,
                Some(SpfError::in_directive(t, e)),
            ),
        }
    }

    async fn eval_a_mx(&self, t: &Token, mx: bool) -> Decision {
        let (fqdn, cidr4, cidr6) = match self.domain_dual_cidr(t) {
            Ok(v) => v,
            Err(e) => {
                self.fire_directive(t, "", false);
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                );
            }
        };
        self.fire_directive(t, &fqdn, false);
        let result = match qualifier_result(t.qualifier) {
            Ok(r) => r,
            Err(e) => {
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
        };

        let client = self.ip;
        let listener = self.listener();
        let matcher = |addr: IpAddr, host: &str| -> Result<bool, SpfError> {
            let prefix = match addr {
                IpAddr::V4(_) => cidr4,
                IpAddr::V6(_) => cidr6,
            };
            listener.matching_ip(
                t.qualifier.as_str(),
                t.kind.as_str(),
                &t.value,
                &fqdn,
                addr,
                prefix,
                host,
                client,
            );
            Ok(ip_contains(client, addr, prefix))
        };

        let outcome = if mx {
            self.session.resolver.match_mx(&fqdn, &matcher).await
        } else {
            self.session.resolver.match_ip(&fqdn, &matcher).await
        };
        self.fire_lookup_extras(t, &fqdn, outcome.as_ref().ok().map(|(_, e)| e));

        match outcome {
            Ok((found, extras)) => {
                self.note_extras(extras);
                (found, result, None)
            }
            Err(e @ (SpfError::DnsLimitExceeded | SpfError::DnsVoidLookupLimitExceeded)) => (
                true,
                SpfResult::Permerror,
                Some(SpfError::in_directive(t, e)),
            ),
            Err(SpfError::DnsPermerror) => (false, result, None),
            Err(e) => (
                true,
                SpfResult::Temperror,
                Some(SpfError::in_directive(t, e)),
            ),
        }
    }

    async fn eval_ptr(&self, t: &Token) -> Decision {
        let target = match self.resolve_target(
            if t.value.is_empty() {
                &self.domain
            } else {
                &t.value
            },
            false,
        ) {
            Ok(v) => v,
            Err(e) => {
                self.fire_directive(t, "", false);
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                );
            }
        };
        self.fire_directive(t, &target, false);
        let result = match qualifier_result(t.qualifier) {
            Ok(r) => r,
            Err(e) => {
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
        };

        let names = match self.session.resolver.lookup_ptr(self.ip).await {
            Ok((names, extras)) => {
                self.note_extras(extras);
                self.fire_lookup_extras(t, &target, Some(&extras));
                names
            }
            Err(e @ (SpfError::DnsLimitExceeded | SpfError::DnsVoidLookupLimitExceeded)) => {
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
            Err(SpfError::DnsPermerror) => return (false, SpfResult::None, None),
            Err(e) => {
                return (
                    true,
                    SpfResult::Temperror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
        };

        let client = self.ip;
        for name in names.into_iter().take(10) {
            let ptr_domain = normalize_fqdn(&name);
            let validated = ptr_domain == target
                || ptr_domain.ends_with(&format!(".{target}"));
            let matcher = move |addr: IpAddr, _host: &str| -> Result<bool, SpfError> {
                Ok(addr == client && validated)
            };
            match self.session.resolver.match_ip(&ptr_domain, &matcher).await {
                Ok((true, _)) => return (true, result, None),
                Ok((false, _)) => {}
                Err(
                    e @ (SpfError::DnsLimitExceeded | SpfError::DnsVoidLookupLimitExceeded),
                ) => {
                    return (
                        true,
                        SpfResult::Permerror,
                        Some(SpfError::in_directive(t, e)),
                    )
                }
                // A stale PTR target does not fail the mechanism.
                Err(_) => {}
            }
        }
        (false, SpfResult::Fail, None)
    }

    async fn eval_exists(&self, t: &Token) -> Decision {
        let target = match self.resolve_target(&t.value, true) {
            Ok(v) => v,
            Err(e) => {
                self.fire_directive(t, "", false);
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                );
            }
        };
        self.fire_directive(t, &target, false);
        let result = match qualifier_result(t.qualifier) {
            Ok(r) => r,
            Err(e) => {
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                )
            }
        };

        match self.session.resolver.exists(&target).await {
            Ok((found, extras)) => {
                self.note_extras(extras);
                self.fire_lookup_extras(t, &target, Some(&extras));
                (found, result, None)
            }
            // NXDOMAIN is a plain non-match for exists.
            Err(SpfError::DnsPermerror) => (false, result, None),
            Err(e @ (SpfError::DnsLimitExceeded | SpfError::DnsVoidLookupLimitExceeded)) => (
                true,
                SpfResult::Permerror,
                Some(SpfError::in_directive(t, e)),
            ),
            Err(e) => (
                true,
                SpfResult::Temperror,
                Some(SpfError::in_directive(t, e)),
            ),
        }
    }

    async fn eval_include(&self, t: &Token) -> Decision {
        let target = match self.resolve_target(&t.value, true) {
            Ok(v) => v,
            Err(e) => {
                self.fire_directive(t, "", false);
                return (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                );
            }
        };
        self.fire_directive(t, &target, false);

        let child = self.child_frame(target);
        let (child_result, _, child_err) = Box::pin(child.check_host()).await;
        let err = child_err.map(|e| SpfError::in_directive(t, e));

        // The include table of RFC 7208 Section 5.2.
        match child_result {
            SpfResult::Pass => match qualifier_result(t.qualifier) {
                Ok(result) => (true, result, err),
                Err(e) => (
                    true,
                    SpfResult::Permerror,
                    Some(SpfError::in_directive(t, e)),
                ),
            },
            SpfResult::Fail | SpfResult::Softfail | SpfResult::Neutral => {
                (false, SpfResult::None, err)
            }
            SpfResult::Temperror => (true, SpfResult::Temperror, err),
            _ => (true, SpfResult::Permerror, err),
        }
    }

    async fn handle_redirect(&self, t: &Token) -> (SpfResult, String, Option<SpfError>) {
        let target = match self.resolve_target(&t.value, true) {
            Ok(v) => v,
            Err(e) => {
                self.fire_directive(t, "", false);
                return (
                    SpfResult::Permerror,
                    String::new(),
                    Some(SpfError::in_directive(t, e)),
                );
            }
        };
        self.fire_directive(t, &target, false);

        let child = self.child_frame(target);
        let (result, explanation, child_err) = Box::pin(child.check_host()).await;
        let err = child_err.map(|e| SpfError::in_directive(t, e));

        // RFC 7208 Section 6.1: no record or a malformed target is a
        // permerror rather than none.
        if err.is_some() {
            return (SpfResult::Permerror, String::new(), err);
        }
        match result {
            SpfResult::None | SpfResult::Permerror | SpfResult::Unreliable => {
                (SpfResult::Permerror, String::new(), err)
            }
            other => (other, explanation, err),
        }
    }

    async fn handle_explanation(&self, t: &Token) -> Result<String, SpfError> {
        // The exp= value itself is a domain-spec; exp-only letters are
        // admitted in the fetched text, not here.
        let target = self
            .resolve_target(&t.value, false)
            .map_err(|e| SpfError::in_directive(t, e))?;
        let (txts, _) = self
            .session
            .resolver
            .lookup_txt(&target)
            .await
            .map_err(|e| SpfError::in_directive(t, e))?;
        // RFC 7208 Section 6.2: concatenate with no separators.
        let joined = txts.concat();
        let expansion = self
            .expand_macros(&joined, true)
            .map_err(|e| SpfError::in_directive(t, e))?;
        Ok(expansion.text)
    }

    fn fire_lookup_extras(&self, t: &Token, fqdn: &str, extras: Option<&ResponseExtras>) {
        self.listener().lookup_extras(
            t.qualifier.as_str(),
            t.kind.as_str(),
            &t.value,
            fqdn,
            extras,
        );
    }

    fn child_frame(&self, domain: String) -> Frame<'_, '_, R, L> {
        Frame {
            session: self.session,
            ip: self.ip,
            domain,
            sender: self.sender.clone(),
            extras: Mutex::new(None),
        }
    }
}

/// Token partition: mechanisms in document order, at most one redirect
/// and one exp, unknown modifiers set aside for reporting.
struct SortedTokens {
    mechanisms: Vec<Token>,
    redirect: Option<Token>,
    explanation: Option<Token>,
    unknown_modifiers: Vec<Token>,
    saw_all: bool,
}

fn sort_tokens(tokens: Vec<Token>) -> Result<SortedTokens, SpfError> {
    let mut sorted = SortedTokens {
        mechanisms: Vec::with_capacity(tokens.len()),
        redirect: None,
        explanation: None,
        unknown_modifiers: Vec::new(),
        saw_all: false,
    };
    for token in tokens {
        if token.is_err() {
            return Err(SpfError::in_directive(&token, SpfError::WrongSyntax));
        }
        if token.kind.is_mechanism() {
            if token.kind == TermKind::All {
                sorted.saw_all = true;
            }
            sorted.mechanisms.push(token);
        } else if token.kind == TermKind::Redirect {
            if sorted.redirect.is_some() {
                return Err(SpfError::TooManyRedirects);
            }
            sorted.redirect = Some(token);
        } else if token.kind == TermKind::Exp {
            if sorted.explanation.is_some() {
                return Err(SpfError::TooManyExps);
            }
            sorted.explanation = Some(token);
        } else {
            sorted.unknown_modifiers.push(token);
        }
    }
    Ok(sorted)
}

fn qualifier_result(q: Qualifier) -> Result<SpfResult, SpfError> {
    match q {
        Qualifier::Plus => Ok(SpfResult::Pass),
        Qualifier::Minus => Ok(SpfResult::Fail),
        Qualifier::Tilde => Ok(SpfResult::Softfail),
        Qualifier::Question => Ok(SpfResult::Neutral),
        Qualifier::Err => Err(SpfError::WrongSyntax),
    }
}

fn parse_cidr_len(part: Option<&str>, bits: u8) -> Result<u8, SpfError> {
    match part {
        None | Some("") => Ok(bits),
        Some(s) => {
            let n: u8 = s.parse().map_err(|_| SpfError::InvalidCidrLength)?;
            if n > bits {
                return Err(SpfError::InvalidCidrLength);
            }
            Ok(n)
        }
    }
}

/// Parses an `ip4:`/`ip6:` value as an address or CIDR of the right
/// family.
fn parse_ip_value(value: &str, v6: bool) -> Result<(IpAddr, u8), SpfError> {
    let family_err = || if v6 { SpfError::NotIpv6 } else { SpfError::NotIpv4 };
    let (addr_str, prefix_str) = match value.rfind('/') {
        Some(pos) if !value[pos + 1..].is_empty()
            && value[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            (&value[..pos], Some(&value[pos + 1..]))
        }
        _ => (value, None),
    };
    let bits = if v6 { 128 } else { 32 };
    let prefix = match prefix_str {
        None => bits,
        Some(p) => {
            let n: u8 = p.parse().map_err(|_| SpfError::InvalidCidrLength)?;
            if n > bits {
                return Err(SpfError::InvalidCidrLength);
            }
            n
        }
    };
    if v6 {
        let addr: Ipv6Addr = addr_str.parse().map_err(|_| family_err())?;
        Ok((IpAddr::V6(addr), prefix))
    } else {
        let addr: Ipv4Addr = addr_str.parse().map_err(|_| family_err())?;
        Ok((IpAddr::V4(addr), prefix))
    }
}

/// Containment check with cross-family mapping: a v4-mapped v6 client can
/// match an `ip4` network and vice versa.
fn ip_contains(client: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match network {
        IpAddr::V4(net) => {
            let client = match client {
                IpAddr::V4(c) => c,
                IpAddr::V6(c) => match c.to_ipv4_mapped() {
                    Some(c) => c,
                    None => return false,
                },
            };
            ip4_in_network(client, net, prefix)
        }
        IpAddr::V6(net) => {
            let client = match client {
                IpAddr::V6(c) => c,
                IpAddr::V4(c) => c.to_ipv6_mapped(),
            };
            ip6_in_network(client, net, prefix)
        }
    }
}

fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = !0u32 << (32 - prefix);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 128 {
        return false;
    }
    let mask = !0u128 << (128 - prefix);
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}
