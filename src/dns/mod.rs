//! The resolver discipline layer: the DNS contract the engine evaluates
//! against, plus the budget-enforcing wrapper and the shipped transports.
//!
//! The engine never talks to the network itself; it only sees
//! [`Resolver`]. NXDOMAIN (RCODE 3) surfaces as
//! [`SpfError::DnsPermerror`], any other non-zero RCODE or timeout as
//! [`SpfError::DnsTemperror`].

pub mod dump;
pub mod limited;
pub mod mock;
pub mod system;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SpfError;

pub use dump::CacheDump;
pub use limited::LimitedResolver;
pub use mock::MockResolver;
pub use system::HickoryResolver;

/// Side-channel returned with every DNS answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseExtras {
    /// Minimum TTL over all answer records.
    pub ttl: Duration,
    /// True iff the answer set was empty with RCODE 0. (NXDOMAIN is also
    /// a void lookup, but surfaces as [`SpfError::DnsPermerror`].)
    pub void: bool,
}

impl ResponseExtras {
    pub fn new(ttl: Duration) -> ResponseExtras {
        ResponseExtras { ttl, void: false }
    }

    /// Extras for a response with zero relevant answers.
    pub fn void_response() -> ResponseExtras {
        ResponseExtras {
            ttl: Duration::ZERO,
            void: true,
        }
    }
}

/// Data plus extras; errors carry no extras because the only error that
/// implies a void lookup is [`SpfError::DnsPermerror`] itself.
pub type DnsResult<T> = Result<(T, ResponseExtras), SpfError>;

/// Compares one resolved address against the client. `name` is the host
/// the address belongs to, for observability only. A returned error stops
/// the resolver's iteration and becomes the lookup's error.
pub type IpMatcher<'a> = dyn Fn(IpAddr, &str) -> Result<bool, SpfError> + Send + Sync + 'a;

/// Abstraction over DNS the SPF engine evaluates against.
pub trait Resolver: Send + Sync {
    /// TXT records for `name`, concatenating multi-string records without
    /// separators. NXDOMAIN behaves as an empty answer. Reserved for
    /// `exp=` texts and exempt from lookup budgets.
    fn lookup_txt(&self, name: &str) -> impl Future<Output = DnsResult<Vec<String>>> + Send;

    /// Like [`Resolver::lookup_txt`], but NXDOMAIN is
    /// [`SpfError::DnsPermerror`].
    fn lookup_txt_strict(&self, name: &str)
        -> impl Future<Output = DnsResult<Vec<String>>> + Send;

    /// True iff the A RRset for `name` is non-empty (even for IPv6
    /// connections).
    fn exists(&self, name: &str) -> impl Future<Output = DnsResult<bool>> + Send;

    /// Looks up A and AAAA for `name` and runs `matcher` per address,
    /// stopping at the first match or matcher error.
    fn match_ip(
        &self,
        name: &str,
        matcher: &IpMatcher<'_>,
    ) -> impl Future<Output = DnsResult<bool>> + Send;

    /// Looks up MX for `name`, then behaves like [`Resolver::match_ip`]
    /// over each exchange, stopping at the first match.
    fn match_mx(
        &self,
        name: &str,
        matcher: &IpMatcher<'_>,
    ) -> impl Future<Output = DnsResult<bool>> + Send;

    /// PTR records for `addr`; the arpa form is constructed here.
    fn lookup_ptr(&self, addr: IpAddr) -> impl Future<Output = DnsResult<Vec<String>>> + Send;
}

impl<R: Resolver> Resolver for &R {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        (**self).lookup_txt(name).await
    }

    async fn lookup_txt_strict(&self, name: &str) -> DnsResult<Vec<String>> {
        (**self).lookup_txt_strict(name).await
    }

    async fn exists(&self, name: &str) -> DnsResult<bool> {
        (**self).exists(name).await
    }

    async fn match_ip(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        (**self).match_ip(name, matcher).await
    }

    async fn match_mx(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        (**self).match_mx(name, matcher).await
    }

    async fn lookup_ptr(&self, addr: IpAddr) -> DnsResult<Vec<String>> {
        (**self).lookup_ptr(addr).await
    }
}

impl<R: Resolver> Resolver for Arc<R> {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        (**self).lookup_txt(name).await
    }

    async fn lookup_txt_strict(&self, name: &str) -> DnsResult<Vec<String>> {
        (**self).lookup_txt_strict(name).await
    }

    async fn exists(&self, name: &str) -> DnsResult<bool> {
        (**self).exists(name).await
    }

    async fn match_ip(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        (**self).match_ip(name, matcher).await
    }

    async fn match_mx(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        (**self).match_mx(name, matcher).await
    }

    async fn lookup_ptr(&self, addr: IpAddr) -> DnsResult<Vec<String>> {
        (**self).lookup_ptr(addr).await
    }
}

/// The reverse-lookup name for an address: dotted-quad reversed under
/// `in-addr.arpa.` for IPv4, reversed nibbles under `ip6.arpa.` for IPv6.
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut s = String::with_capacity(73);
            for b in v6.octets().iter().rev() {
                s.push_str(&format!("{:x}.{:x}.", b & 0xf, b >> 4));
            }
            s.push_str("ip6.arpa.");
            s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_name_v4() {
        assert_eq!(
            reverse_name("192.0.2.3".parse().unwrap()),
            "3.2.0.192.in-addr.arpa."
        );
    }

    #[test]
    fn reverse_name_v6() {
        assert_eq!(
            reverse_name("2001:db8::1".parse().unwrap()),
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa."
        );
    }
}
