//! In-memory resolver for tests and offline evaluation.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{reverse_name, DnsResult, IpMatcher, Resolver, ResponseExtras};
use crate::error::SpfError;
use crate::fqdn::normalize_fqdn;

/// A [`Resolver`] over hand-fed zone data.
///
/// Names are normalized (lowercased, root dot) on insert and lookup, so
/// `add_txt("Example.COM", ...)` and a query for `example.com.` meet.
/// Unknown names behave as NXDOMAIN; a name registered with an empty
/// record set behaves as a void answer.
#[derive(Clone, Default)]
pub struct MockResolver {
    zones: Arc<RwLock<Zones>>,
}

#[derive(Default)]
struct Zones {
    txt: HashMap<String, Vec<String>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
    aaaa: HashMap<String, Vec<Ipv6Addr>>,
    mx: HashMap<String, Vec<String>>,
    ptr: HashMap<String, Vec<String>>,
    temperror: HashSet<String>,
}

const MOCK_TTL: Duration = Duration::from_secs(60);

impl MockResolver {
    pub fn new() -> MockResolver {
        MockResolver::default()
    }

    pub fn add_txt(&self, name: &str, records: Vec<String>) {
        self.zones
            .write()
            .unwrap()
            .txt
            .insert(normalize_fqdn(name), records);
    }

    pub fn add_a(&self, name: &str, addrs: Vec<Ipv4Addr>) {
        self.zones
            .write()
            .unwrap()
            .a
            .insert(normalize_fqdn(name), addrs);
    }

    pub fn add_aaaa(&self, name: &str, addrs: Vec<Ipv6Addr>) {
        self.zones
            .write()
            .unwrap()
            .aaaa
            .insert(normalize_fqdn(name), addrs);
    }

    pub fn add_mx(&self, name: &str, exchanges: Vec<String>) {
        self.zones
            .write()
            .unwrap()
            .mx
            .insert(normalize_fqdn(name), exchanges);
    }

    /// Registers PTR names for an address.
    pub fn add_ptr(&self, addr: IpAddr, names: Vec<String>) {
        self.zones
            .write()
            .unwrap()
            .ptr
            .insert(reverse_name(addr), names);
    }

    /// Any lookup of `name` fails with [`SpfError::DnsTemperror`].
    pub fn add_temperror(&self, name: &str) {
        self.zones
            .write()
            .unwrap()
            .temperror
            .insert(normalize_fqdn(name));
    }

    fn check_temperror(&self, name: &str) -> Result<(), SpfError> {
        if self
            .zones
            .read()
            .unwrap()
            .temperror
            .contains(&normalize_fqdn(name))
        {
            Err(SpfError::DnsTemperror)
        } else {
            Ok(())
        }
    }

    fn extras_for(len: usize) -> ResponseExtras {
        if len == 0 {
            ResponseExtras::void_response()
        } else {
            ResponseExtras::new(MOCK_TTL)
        }
    }

    /// A and AAAA records for `name`, as IpAddrs. `None` means NXDOMAIN.
    fn addresses(&self, name: &str) -> Option<Vec<IpAddr>> {
        let key = normalize_fqdn(name);
        let zones = self.zones.read().unwrap();
        let v4 = zones.a.get(&key);
        let v6 = zones.aaaa.get(&key);
        if v4.is_none() && v6.is_none() {
            return None;
        }
        let mut out: Vec<IpAddr> = Vec::new();
        if let Some(v4) = v4 {
            out.extend(v4.iter().copied().map(IpAddr::V4));
        }
        if let Some(v6) = v6 {
            out.extend(v6.iter().copied().map(IpAddr::V6));
        }
        Some(out)
    }
}

impl Resolver for MockResolver {
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        self.check_temperror(name)?;
        let key = normalize_fqdn(name);
        match self.zones.read().unwrap().txt.get(&key) {
            Some(records) => Ok((records.clone(), Self::extras_for(records.len()))),
            None => Ok((Vec::new(), ResponseExtras::void_response())),
        }
    }

    async fn lookup_txt_strict(&self, name: &str) -> DnsResult<Vec<String>> {
        self.check_temperror(name)?;
        let key = normalize_fqdn(name);
        match self.zones.read().unwrap().txt.get(&key) {
            Some(records) => Ok((records.clone(), Self::extras_for(records.len()))),
            None => Err(SpfError::DnsPermerror),
        }
    }

    async fn exists(&self, name: &str) -> DnsResult<bool> {
        self.check_temperror(name)?;
        let key = normalize_fqdn(name);
        match self.zones.read().unwrap().a.get(&key) {
            Some(addrs) => Ok((!addrs.is_empty(), Self::extras_for(addrs.len()))),
            None => Err(SpfError::DnsPermerror),
        }
    }

    async fn match_ip(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        self.check_temperror(name)?;
        let addrs = self.addresses(name).ok_or(SpfError::DnsPermerror)?;
        let extras = Self::extras_for(addrs.len());
        for addr in addrs {
            if matcher(addr, name)? {
                return Ok((true, extras));
            }
        }
        Ok((false, extras))
    }

    async fn match_mx(&self, name: &str, matcher: &IpMatcher<'_>) -> DnsResult<bool> {
        self.check_temperror(name)?;
        let key = normalize_fqdn(name);
        let exchanges = match self.zones.read().unwrap().mx.get(&key) {
            Some(hosts) => hosts.clone(),
            None => return Err(SpfError::DnsPermerror),
        };
        let extras = Self::extras_for(exchanges.len());
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
        let key = reverse_name(addr);
        self.check_temperror(&key)?;
        match self.zones.read().unwrap().ptr.get(&key) {
            Some(names) => Ok((names.clone(), Self::extras_for(names.len()))),
            None => Err(SpfError::DnsPermerror),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn names_are_normalized() {
        let mock = MockResolver::new();
        mock.add_txt("Example.COM", vec!["v=spf1 -all".into()]);
        let (txts, extras) = mock.lookup_txt_strict("example.com.").await.unwrap();
        assert_eq!(txts, vec!["v=spf1 -all".to_string()]);
        assert!(!extras.void);
    }

    #[tokio::test]
    async fn unknown_name_is_nxdomain() {
        let mock = MockResolver::new();
        assert_eq!(
            mock.lookup_txt_strict("missing.example.").await.unwrap_err(),
            SpfError::DnsPermerror
        );
        // The lenient variant treats NXDOMAIN as an empty, void answer.
        let (txts, extras) = mock.lookup_txt("missing.example.").await.unwrap();
        assert!(txts.is_empty());
        assert!(extras.void);
    }

    #[tokio::test]
    async fn match_ip_covers_both_families() {
        let mock = MockResolver::new();
        mock.add_a("host.example.", vec![Ipv4Addr::new(192, 0, 2, 1)]);
        mock.add_aaaa("host.example.", vec!["2001:db8::1".parse().unwrap()]);

        let want: IpAddr = "2001:db8::1".parse().unwrap();
        let (found, _) = mock
            .match_ip("host.example.", &|ip, _| Ok(ip == want))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn matcher_errors_propagate() {
        let mock = MockResolver::new();
        mock.add_a("host.example.", vec![Ipv4Addr::new(192, 0, 2, 1)]);
        let err = mock
            .match_ip("host.example.", &|_, _| Err(SpfError::DnsLimitExceeded))
            .await
            .unwrap_err();
        assert_eq!(err, SpfError::DnsLimitExceeded);
    }

    #[tokio::test]
    async fn temperror_injection() {
        let mock = MockResolver::new();
        mock.add_txt("slow.example.", vec!["v=spf1".into()]);
        mock.add_temperror("slow.example.");
        assert_eq!(
            mock.lookup_txt_strict("slow.example.").await.unwrap_err(),
            SpfError::DnsTemperror
        );
    }

    #[tokio::test]
    async fn ptr_lookup_uses_arpa_form() {
        let mock = MockResolver::new();
        let addr: IpAddr = "192.0.2.10".parse().unwrap();
        mock.add_ptr(addr, vec!["mail.example.com.".into()]);
        let (names, _) = mock.lookup_ptr(addr).await.unwrap();
        assert_eq!(names, vec!["mail.example.com.".to_string()]);
    }
}
