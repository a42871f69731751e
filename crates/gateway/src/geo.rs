//! Country resolution for the geographic policy.
//!
//! The resolver is a trait so deployments can plug a real geo database in;
//! the built-in implementation is a static CIDR table loaded from
//! configuration, which covers the common "block these regions" case
//! without an external dependency.

use std::net::IpAddr;

/// Maps a client IP to an ISO country code.
pub trait CountryResolver: Send + Sync {
    /// `None` when the IP cannot be attributed.
    fn country_for(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver that knows nothing; geo policy never matches.
#[derive(Debug, Default)]
pub struct NoGeoResolver;

impl CountryResolver for NoGeoResolver {
    fn country_for(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// One CIDR -> country row.
#[derive(Debug, Clone)]
pub struct CidrCountry {
    pub network: IpAddr,
    pub prefix_len: u8,
    pub country: String,
}

/// Static CIDR-table resolver. Longest-prefix match wins.
#[derive(Debug, Default)]
pub struct StaticCountryTable {
    rows: Vec<CidrCountry>,
}

impl StaticCountryTable {
    #[must_use]
    pub fn new(mut rows: Vec<CidrCountry>) -> Self {
        // Longest prefix first so the scan stops at the most specific row.
        rows.sort_by(|a, b| b.prefix_len.cmp(&a.prefix_len));
        Self { rows }
    }

    /// Parse rows like `203.0.113.0/24=NZ`.
    pub fn parse(entries: &[String]) -> Result<Self, String> {
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let (cidr, country) = entry
                .split_once('=')
                .ok_or_else(|| format!("missing '=' in geo entry: {entry}"))?;
            let (net, len) = cidr
                .split_once('/')
                .ok_or_else(|| format!("missing '/' in CIDR: {cidr}"))?;
            let network: IpAddr = net
                .parse()
                .map_err(|e| format!("bad network in {cidr}: {e}"))?;
            let prefix_len: u8 = len
                .parse()
                .map_err(|e| format!("bad prefix length in {cidr}: {e}"))?;
            rows.push(CidrCountry {
                network,
                prefix_len,
                country: country.trim().to_uppercase(),
            });
        }
        Ok(Self::new(rows))
    }
}

/// Whether `ip` falls inside `network/prefix_len`. Mixed families never match.
#[must_use]
pub fn cidr_contains(network: IpAddr, prefix_len: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let len = u32::from(prefix_len.min(32));
            if len == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - len);
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let len = u32::from(prefix_len.min(128));
            if len == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - len);
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

impl CountryResolver for StaticCountryTable {
    fn country_for(&self, ip: IpAddr) -> Option<String> {
        self.rows
            .iter()
            .find(|row| cidr_contains(row.network, row.prefix_len, ip))
            .map(|row| row.country.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_matching() {
        let net: IpAddr = "203.0.113.0".parse().unwrap();
        assert!(cidr_contains(net, 24, "203.0.113.77".parse().unwrap()));
        assert!(!cidr_contains(net, 24, "203.0.114.1".parse().unwrap()));
        assert!(cidr_contains(net, 0, "8.8.8.8".parse().unwrap()));
        // v4 table never matches v6 callers.
        assert!(!cidr_contains(net, 24, "::1".parse().unwrap()));
    }

    #[test]
    fn longest_prefix_wins() {
        let table = StaticCountryTable::parse(&[
            "203.0.0.0/16=AU".to_owned(),
            "203.0.113.0/24=NZ".to_owned(),
        ])
        .unwrap();
        assert_eq!(
            table.country_for("203.0.113.5".parse().unwrap()).as_deref(),
            Some("NZ")
        );
        assert_eq!(
            table.country_for("203.0.1.5".parse().unwrap()).as_deref(),
            Some("AU")
        );
        assert!(table.country_for("8.8.8.8".parse().unwrap()).is_none());
    }

    #[test]
    fn parse_rejects_malformed_rows() {
        assert!(StaticCountryTable::parse(&["no-equals".to_owned()]).is_err());
        assert!(StaticCountryTable::parse(&["1.2.3.4=US".to_owned()]).is_err());
        assert!(StaticCountryTable::parse(&["1.2.3.4/xx=US".to_owned()]).is_err());
    }
}
