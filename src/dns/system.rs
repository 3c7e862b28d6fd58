//! Live DNS transport over hickory-resolver.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::{RData, Record};
use hickory_resolver::TokioResolver;
use tracing::trace;

use super::{DnsResult, IpMatcher, Resolver, ResponseExtras};
use crate::error::SpfError;

/// [`Resolver`] backed by a hickory `TokioResolver`.
///
/// RCODE mapping per RFC 7208 Section 5: NXDOMAIN surfaces as
/// [`SpfError::DnsPermerror`]; an empty answer set is a void success; any
/// other failure (SERVFAIL, timeout) is [`SpfError::DnsTemperror`].
///
/// `parallelism(1)` forces strictly sequential A-then-AAAA lookups for
/// cache-friendly or deterministic operation; the default issues the two
/// family queries concurrently.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
    parallelism: usize,
}

impl HickoryResolver {
    pub fn new() -> HickoryResolver {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        HickoryResolver {
            resolver,
            parallelism: 2,
        }
    }

    /// Anything less than 1 is ignored.
    pub fn parallelism(mut self, n: usize) -> HickoryResolver {
        if n >= 1 {
            self.parallelism = n;
        }
        self
    }

    async fn query_family(&self, name: &str, v6: bool) -> DnsResult<Vec<IpAddr>> {
        if v6 {
            match self.resolver.ipv6_lookup(name).await {
                Ok(lookup) => {
                    let addrs: Vec<IpAddr> =
                        lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect();
                    Ok((addrs, extras_of(lookup.as_lookup().record_iter())))
                }
                Err(e) if e.is_nx_domain() => Err(SpfError::DnsPermerror),
                Err(e) if e.is_no_records_found() => {
                    Ok((Vec::new(), ResponseExtras::void_response()))
                }
                Err(_) => Err(SpfError::DnsTemperror),
            }
        } else {
            match self.resolver.ipv4_lookup(name).await {
                Ok(lookup) => {
                    let addrs: Vec<IpAddr> = lookup.iter().map(|a| IpAddr::V4(a.0)).collect();
                    Ok((addrs, extras_of(lookup.as_lookup().record_iter())))
                }
                Err(e) if e.is_nx_domain() => Err(SpfError::DnsPermerror),
                Err(e) if e.is_no_records_found() => {
                    Ok((Vec::new(), ResponseExtras::void_response()))
                }
                Err(_) => Err(SpfError::DnsTemperror),
            }
        }
    }

    async fn query_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        trace!("txt lookup: {}", name);
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                // RFC 1035: the strings of one TXT record concatenate
                // without separators.
                let txts: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part))
                            .collect::<String>()
                    })
                    .collect();
                Ok((txts, extras_of(lookup.as_lookup().record_iter())))
            }
            Err(e) if e.is_nx_domain() => Err(SpfError::DnsPermerror),
            Err(e) if e.is_no_records_found() => Ok((Vec::new(), ResponseExtras::void_response())),
            Err(_) => Err(SpfError::DnsTemperror),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn extras_of<'a>(records: impl Iterator<Item = &'a Record>) -> ResponseExtras {
    let mut ttl: Option<u32> = None;
    let mut count = 0usize;
    for r in records {
        count += 1;
        ttl = Some(ttl.map_or(r.ttl(), |t| t.min(r.ttl())));
    }
    ResponseExtras {
        ttl: Duration::from_secs(u64::from(ttl.unwrap_or(0))),
        void: count == 0,
    }
}

fn fold_extras(a: Option<ResponseExtras>, b: Option<ResponseExtras>) -> ResponseExtras {
    match (a, b) {
        (Some(x), Some(y)) => ResponseExtras {
            ttl: x.ttl.min(y.ttl),
            void: x.void && y.void,
        },
        (Some(x), None) | (None, Some(x)) => x,
        (None, None) => ResponseExtras::void_response(),
    }
}

impl Resolver for HickoryResolver {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        match self.query_txt(name).await {
            // The lenient variant treats NXDOMAIN as an empty answer.
            Err(SpfError::DnsPermerror) => Ok((Vec::new(), ResponseExtras::void_response())),
            other => other,
        }
    }

    async fn lookup_txt_strict(&self, name: &str) -> DnsResult<Vec<String>> {
        self.query_txt(name).await
    }

    async fn exists(&self, name: &str) -> DnsResult<bool> {
        trace!("a lookup (exists): {}", name);
        match self.query_family(name, false).await {
            Ok((addrs, extras)) => Ok((!addrs.is_empty(), extras)),
            Err(e) => Err(e),
        }
    }

    async fn match_ip(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        trace!("a/aaaa lookup: {}", name);
        let (r4, r6) = if self.parallelism <= 1 {
            let r4 = self.query_family(name, false).await;
            if let Ok((addrs, extras)) = &r4 {
                for &addr in addrs {
                    if matcher(addr, name)? {
                        return Ok((true, *extras));
                    }
                }
            }
            // No IPv4 match; fall through to the AAAA set.
            let r6 = self.query_family(name, true).await;
            let r4 = r4.map(|(_, extras)| (Vec::new(), extras));
            (r4, r6)
        } else {
            tokio::join!(self.query_family(name, false), self.query_family(name, true))
        };

        let mut nxdomains = 0;
        let mut extras4 = None;
        let mut extras6 = None;
        for (outcome, slot) in [(r4, &mut extras4), (r6, &mut extras6)] {
            match outcome {
                Ok((addrs, extras)) => {
                    *slot = Some(extras);
                    for addr in addrs {
                        if matcher(addr, name)? {
                            return Ok((true, extras));
                        }
                    }
                }
                Err(SpfError::DnsPermerror) => nxdomains += 1,
                Err(e) => return Err(e),
            }
        }
        if nxdomains == 2 {
            return Err(SpfError::DnsPermerror);
        }
        Ok((false, fold_extras(extras4, extras6)))
    }

    async fn match_mx(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        trace!("mx lookup: {}", name);
        let (exchanges, extras) = match self.resolver.mx_lookup(name).await {
            Ok(lookup) => {
                let exchanges: Vec<String> = lookup
                    .as_lookup()
                    .record_iter()
                    .filter_map(|r| match r.data() {
                        RData::MX(mx) => Some(mx.exchange().to_string()),
                        _ => None,
                    })
                    .collect();
                (exchanges, extras_of(lookup.as_lookup().record_iter()))
            }
            Err(e) if e.is_nx_domain() => return Err(SpfError::DnsPermerror),
            Err(e) if e.is_no_records_found() => {
                return Ok((false, ResponseExtras::void_response()))
            }
            Err(_) => return Err(SpfError::DnsTemperror),
        };

        for exchange in exchanges {
            match self.match_ip(&exchange, matcher).await {
                Ok((true, _)) => return Ok((true, extras)),
                Ok((false, _)) => {}
                // A dangling exchange is no match, not a failure.
                Err(SpfError::DnsPermerror) => {}
                Err(e) => return Err(e),
            }
        }
        Ok((false, extras))
    }

    async fn lookup_ptr(&self, addr: IpAddr) -> DnsResult<Vec<String>> {
        trace!("ptr lookup: {}", addr);
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => {
                let names: Vec<String> = lookup
                    .as_lookup()
                    .record_iter()
                    .filter_map(|r| match r.data() {
                        RData::PTR(ptr) => Some(ptr.0.to_string()),
                        _ => None,
                    })
                    .collect();
                Ok((names, extras_of(lookup.as_lookup().record_iter())))
            }
            Err(e) if e.is_nx_domain() => Err(SpfError::DnsPermerror),
            Err(e) if e.is_no_records_found() => Ok((Vec::new(), ResponseExtras::void_response())),
            Err(_) => Err(SpfError::DnsTemperror),
        }
    }
}
