//! Budget enforcement around any [`Resolver`], per RFC 7208 Section 4.6.4.

use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{DnsResult, IpMatcher, Resolver};
use crate::error::SpfError;

/// Wraps a resolver and enforces the evaluation budgets atomically:
///
/// - at most `lookup_limit` calls overall, `lookup_txt` excepted (it is
///   reserved for `exp=` and RFC-exempt);
/// - at most `mx_queries_limit` address resolutions per `match_mx` call;
/// - at most `void_lookup_limit` void responses.
///
/// Over-budget calls fail with [`SpfError::DnsLimitExceeded`] or
/// [`SpfError::DnsVoidLookupLimitExceeded`]. The counters deplete; wrap a
/// fresh instance per evaluation.
pub struct LimitedResolver<R> {
    lookups: AtomicI32,
    mx_queries_limit: u16,
    void_lookups: AtomicI32,
    inner: R,
}

impl<R: Resolver> LimitedResolver<R> {
    /// `lookup_limit` includes the initial policy TXT lookup.
    pub fn new(
        inner: R,
        lookup_limit: u16,
        mx_queries_limit: u16,
        void_lookup_limit: u16,
    ) -> LimitedResolver<R> {
        LimitedResolver {
            lookups: AtomicI32::new(lookup_limit as i32),
            mx_queries_limit,
            void_lookups: AtomicI32::new(void_lookup_limit as i32),
            inner,
        }
    }

    fn can_lookup(&self) -> bool {
        self.lookups.fetch_sub(1, Ordering::SeqCst) > 0
    }

    /// A void lookup is any call whose extras report void, or that failed
    /// with NXDOMAIN.
    fn charge_void<T>(&self, outcome: DnsResult<T>) -> DnsResult<T> {
        let void = match &outcome {
            Ok((_, extras)) => extras.void,
            Err(SpfError::DnsPermerror) => true,
            Err(_) => false,
        };
        if void && self.void_lookups.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(SpfError::DnsVoidLookupLimitExceeded);
        }
        outcome
    }
}

impl<R: Resolver> Resolver for LimitedResolver<R> {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        self.inner.lookup_txt(name).await
    }

    async fn lookup_txt_strict(&self, name: &str) -> DnsResult<Vec<String>> {
        if !self.can_lookup() {
            return Err(SpfError::DnsLimitExceeded);
        }
        self.charge_void(self.inner.lookup_txt_strict(name).await)
    }

    async fn exists(&self, name: &str) -> DnsResult<bool> {
        if !self.can_lookup() {
            return Err(SpfError::DnsLimitExceeded);
        }
        self.charge_void(self.inner.exists(name).await)
    }

    async fn match_ip(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        if !self.can_lookup() {
            return Err(SpfError::DnsLimitExceeded);
        }
        self.charge_void(self.inner.match_ip(name, matcher).await)
    }

    async fn match_mx(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        if !self.can_lookup() {
            return Err(SpfError::DnsLimitExceeded);
        }
        let budget = AtomicI32::new(self.mx_queries_limit as i32);
        let wrapped = move |ip: IpAddr, host: &str| -> Result<bool, SpfError> {
            if budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
                return Err(SpfError::DnsLimitExceeded);
            }
            matcher(ip, host)
        };
        self.charge_void(self.inner.match_mx(name, &wrapped).await)
    }

    async fn lookup_ptr(&self, addr: IpAddr) -> DnsResult<Vec<String>> {
        if !self.can_lookup() {
            return Err(SpfError::DnsLimitExceeded);
        }
        self.charge_void(self.inner.lookup_ptr(addr).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockResolver;
    use std::net::Ipv4Addr;

    fn zone() -> MockResolver {
        let mock = MockResolver::new();
        mock.add_txt("domain.", vec!["ok".into()]);
        mock.add_a("domain.", vec![Ipv4Addr::new(10, 0, 0, 1)]);
        mock.add_mx("domain.", vec!["domain.".into()]);
        mock.add_a(
            "mxmustfail.",
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ],
        );
        mock.add_mx("mxmustfail.", vec!["mxmustfail.".into()]);
        mock
    }

    fn eq_matcher(want: Ipv4Addr) -> impl Fn(IpAddr, &str) -> Result<bool, SpfError> + Send + Sync
    {
        move |ip, _| Ok(ip == IpAddr::V4(want))
    }

    #[tokio::test]
    async fn lookup_txt_is_exempt() {
        let r = LimitedResolver::new(zone(), 1, 10, 2);
        for _ in 0..3 {
            let (txts, _) = r.lookup_txt("domain.").await.unwrap();
            assert_eq!(txts, vec!["ok".to_string()]);
        }
    }

    #[tokio::test]
    async fn exists_hits_the_limit() {
        let r = LimitedResolver::new(zone(), 2, 10, 2);
        assert!(r.exists("domain.").await.unwrap().0);
        assert!(r.exists("domain.").await.unwrap().0);
        assert_eq!(
            r.exists("domain.").await.unwrap_err(),
            SpfError::DnsLimitExceeded
        );
    }

    #[tokio::test]
    async fn match_ip_hits_the_limit() {
        let r = LimitedResolver::new(zone(), 1, 10, 2);
        let m = eq_matcher(Ipv4Addr::new(10, 0, 0, 1));
        assert!(r.match_ip("domain.", &m).await.unwrap().0);
        assert_eq!(
            r.match_ip("domain.", &m).await.unwrap_err(),
            SpfError::DnsLimitExceeded
        );
    }

    #[tokio::test]
    async fn match_mx_hits_the_limit() {
        let r = LimitedResolver::new(zone(), 1, 10, 2);
        let m = eq_matcher(Ipv4Addr::new(10, 0, 0, 1));
        assert!(r.match_mx("domain.", &m).await.unwrap().0);
        assert_eq!(
            r.match_mx("domain.", &m).await.unwrap_err(),
            SpfError::DnsLimitExceeded
        );
    }

    #[tokio::test]
    async fn match_mx_inner_query_budget() {
        // Three address records but only two inner queries allowed.
        let r = LimitedResolver::new(zone(), 5, 2, 2);
        let m = eq_matcher(Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(
            r.match_mx("mxmustfail.", &m).await.unwrap_err(),
            SpfError::DnsLimitExceeded
        );
    }

    #[tokio::test]
    async fn void_budget_counts_empty_and_nxdomain() {
        let mock = zone();
        mock.add_a("empty.", vec![]);
        let r = LimitedResolver::new(mock, 10, 10, 2);
        // First void: empty answer set.
        assert!(!r.exists("empty.").await.unwrap().0);
        // Second void: NXDOMAIN.
        assert_eq!(
            r.exists("missing.").await.unwrap_err(),
            SpfError::DnsPermerror
        );
        // Third void breaches the budget.
        assert_eq!(
            r.exists("empty.").await.unwrap_err(),
            SpfError::DnsVoidLookupLimitExceeded
        );
    }
}
