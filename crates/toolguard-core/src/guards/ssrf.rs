//! Outbound request guard.
//!
//! Two checkpoints: [`SsrfGuard::validate_url`] before DNS resolution and
//! [`SsrfGuard::validate_resolved`] on every address the resolver returns,
//! which closes the DNS-rebinding gap. Private and metadata literals are
//! denied no matter what the allowlist says.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use url::{Host, Url};

use crate::domain::{ConfigurationError, GuardViolation, SsrfGuardConfig};

const METADATA_IPS: [IpAddr; 3] = [
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    IpAddr::V4(Ipv4Addr::new(169, 254, 170, 2)),
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)),
];

const METADATA_HOSTS: [&str; 2] = ["metadata.google.internal", "metadata.azure.com"];

/// Compiled [`SsrfGuardConfig`].
#[derive(Debug, Clone)]
pub struct SsrfGuard {
    enabled: bool,
    allowed_hosts: Vec<String>,
    blocked_cidrs: Vec<IpNet>,
}

impl SsrfGuard {
    pub fn new(config: &SsrfGuardConfig) -> Result<Self, ConfigurationError> {
        let blocked_cidrs = config
            .blocked_cidrs
            .iter()
            .map(|cidr| parse_cidr(cidr))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            enabled: config.enabled,
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
            blocked_cidrs,
        })
    }

    /// Pre-DNS check of a request URL. Returns the parsed URL.
    pub fn validate_url(&self, raw: &str) -> Result<Url, GuardViolation> {
        let url = Url::parse(raw.trim())
            .map_err(|e| GuardViolation::Ssrf(format!("invalid URL '{raw}': {e}")))?;

        if !self.enabled {
            return Ok(url);
        }

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GuardViolation::Ssrf(format!(
                    "scheme '{other}' is not allowed; only http and https"
                )))
            }
        }

        match url.host() {
            None => Err(GuardViolation::Ssrf(format!("URL '{raw}' has no host"))),
            Some(Host::Ipv4(ip)) => self.check_literal(IpAddr::V4(ip)).map(|()| url),
            Some(Host::Ipv6(ip)) => self.check_literal(IpAddr::V6(ip)).map(|()| url),
            Some(Host::Domain(domain)) => {
                let host = normalize_host(domain);
                if METADATA_HOSTS.contains(&host.as_str()) {
                    return Err(GuardViolation::Ssrf(format!(
                        "'{host}' is a cloud metadata endpoint"
                    )));
                }
                let is_localhost = host == "localhost" || host.ends_with(".localhost");
                if is_localhost && !self.is_allowed_host(&host) {
                    return Err(GuardViolation::Ssrf(format!(
                        "'{host}' resolves to the local machine"
                    )));
                }
                Ok(url)
            }
        }
    }

    /// Post-DNS check of one resolved address for `host`.
    ///
    /// `blocked_cidrs` is authoritative. Built-in private ranges are waived
    /// only when the hostname itself is allowlisted.
    pub fn validate_resolved(&self, host: &str, ip: IpAddr) -> Result<(), GuardViolation> {
        if !self.enabled {
            return Ok(());
        }
        let ip = unmap(ip);

        if METADATA_IPS.contains(&ip) {
            return Err(GuardViolation::Ssrf(format!(
                "'{host}' resolved to cloud metadata address {ip}"
            )));
        }
        if let Some(net) = self.blocked_cidr_for(ip) {
            return Err(GuardViolation::Ssrf(format!(
                "'{host}' resolved to {ip}, inside blocked range {net}"
            )));
        }
        if let Some(class) = reserved_class(ip) {
            if !self.is_allowed_host(&normalize_host(host)) {
                return Err(GuardViolation::Ssrf(format!(
                    "'{host}' resolved to {class} address {ip}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn check_literal(&self, ip: IpAddr) -> Result<(), GuardViolation> {
        let ip = unmap(ip);
        if METADATA_IPS.contains(&ip) {
            return Err(GuardViolation::Ssrf(format!(
                "{ip} is a cloud metadata address"
            )));
        }
        if let Some(class) = reserved_class(ip) {
            return Err(GuardViolation::Ssrf(format!("{ip} is a {class} address")));
        }
        if let Some(net) = self.blocked_cidr_for(ip) {
            return Err(GuardViolation::Ssrf(format!(
                "{ip} is inside blocked range {net}"
            )));
        }
        Ok(())
    }

    fn blocked_cidr_for(&self, ip: IpAddr) -> Option<&IpNet> {
        self.blocked_cidrs.iter().find(|net| net.contains(&ip))
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|entry| match entry.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|head| head.ends_with('.') && head.len() > 1),
            None => entry == host,
        })
    }
}

fn parse_cidr(raw: &str) -> Result<IpNet, ConfigurationError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<IpNet>()
        .or_else(|_| trimmed.parse::<IpAddr>().map(IpNet::from))
        .map_err(|e| ConfigurationError::InvalidCidr {
            cidr: raw.to_string(),
            reason: e.to_string(),
        })
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// IPv4-mapped IPv6 addresses are classified as their IPv4 form.
fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Built-in non-routable class of `ip`, if any.
fn reserved_class(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            if v4.is_loopback() {
                Some("loopback")
            } else if v4.is_private() {
                Some("private")
            } else if v4.is_link_local() {
                Some("link-local")
            } else if v4.is_unspecified() {
                Some("unspecified")
            } else if v4.is_broadcast() {
                Some("broadcast")
            } else if a == 100 && (b & 0xc0) == 64 {
                Some("carrier-grade NAT")
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            if v6.is_loopback() {
                Some("loopback")
            } else if v6.is_unspecified() {
                Some("unspecified")
            } else if (head & 0xffc0) == 0xfe80 {
                Some("link-local")
            } else if (head & 0xfe00) == 0xfc00 {
                Some("unique-local")
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn guard(allowed: &[&str], blocked: &[&str]) -> SsrfGuard {
        SsrfGuard::new(&SsrfGuardConfig {
            enabled: true,
            allowed_hosts: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_cidrs: blocked.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_public_url_passes() {
        let url = guard(&[], &[]).validate_url("https://example.com/a?b=c").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        let g = guard(&[], &[]);
        for raw in ["file:///etc/passwd", "gopher://x/", "ftp://example.com/"] {
            assert!(g.validate_url(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_private_literals_rejected_even_when_allowlisted() {
        let g = guard(&["127.0.0.1", "10.0.0.5", "169.254.169.254"], &[]);
        for raw in [
            "http://127.0.0.1/",
            "http://10.0.0.5/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://[fd12::1]/",
            "http://100.64.1.1/",
            "http://0.0.0.0/",
        ] {
            assert!(g.validate_url(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_metadata_address_reason() {
        let err = guard(&[], &[])
            .validate_url("http://169.254.169.254/")
            .unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn test_encoded_ipv4_forms_are_normalized() {
        let g = guard(&[], &[]);
        assert!(g.validate_url("http://2130706433/").is_err());
        assert!(g.validate_url("http://0x7f.0.0.1/").is_err());
        assert!(g.validate_url("http://0177.0.0.1/").is_err());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_is_classified_as_ipv4() {
        let g = guard(&[], &[]);
        assert!(g.validate_url("http://[::ffff:127.0.0.1]/").is_err());
        assert!(g.validate_url("http://[::ffff:169.254.169.254]/").is_err());
    }

    #[test]
    fn test_localhost_requires_allowlist() {
        assert!(guard(&[], &[]).validate_url("http://localhost:8080/").is_err());
        assert!(guard(&[], &[]).validate_url("http://api.localhost/").is_err());
        assert!(guard(&["localhost"], &[])
            .validate_url("http://localhost:8080/")
            .is_ok());
    }

    #[test]
    fn test_metadata_hostnames_denied_even_when_allowlisted() {
        let g = guard(&["metadata.google.internal"], &[]);
        assert!(g
            .validate_url("http://metadata.google.internal/computeMetadata/v1/")
            .is_err());
        assert!(g.validate_url("http://METADATA.AZURE.COM./").is_err());
    }

    #[test]
    fn test_blocked_cidr_applies_to_public_literal() {
        let g = guard(&[], &["203.0.113.0/24"]);
        assert!(g.validate_url("http://203.0.113.7/").is_err());
        assert!(g.validate_url("http://198.51.100.7/").is_ok());
    }

    #[test]
    fn test_resolved_private_ip_needs_allowlisted_hostname() {
        let g = guard(&["*.corp.example"], &[]);
        let private: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(g.validate_resolved("evil.example", private).is_err());
        assert!(g.validate_resolved("wiki.corp.example", private).is_ok());
        assert!(g.validate_resolved("corp.example", private).is_err());
    }

    #[test]
    fn test_resolved_blocked_cidr_is_authoritative() {
        let g = guard(&["wiki.corp.example"], &["10.1.0.0/16"]);
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(g.validate_resolved("wiki.corp.example", ip).is_err());
    }

    #[test]
    fn test_resolved_metadata_always_denied() {
        let g = guard(&["rebind.example"], &[]);
        let ip: IpAddr = "169.254.169.254".parse().unwrap();
        assert!(g.validate_resolved("rebind.example", ip).is_err());
        let mapped: IpAddr = "::ffff:169.254.169.254".parse().unwrap();
        assert!(g.validate_resolved("rebind.example", mapped).is_err());
    }

    #[test]
    fn test_disabled_guard_allows_everything_parseable() {
        let g = SsrfGuard::new(&SsrfGuardConfig {
            enabled: false,
            allowed_hosts: BTreeSet::new(),
            blocked_cidrs: BTreeSet::new(),
        })
        .unwrap();
        assert!(g.validate_url("http://127.0.0.1/").is_ok());
        assert!(g
            .validate_resolved("x", "169.254.169.254".parse().unwrap())
            .is_ok());
    }

    #[test]
    fn test_invalid_cidr_is_configuration_error() {
        let err = SsrfGuard::new(&SsrfGuardConfig {
            enabled: true,
            allowed_hosts: BTreeSet::new(),
            blocked_cidrs: ["10.0.0.0/33".to_string()].into(),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidCidr { .. }));
    }

    #[test]
    fn test_bare_ip_in_blocked_cidrs_is_a_host_route() {
        let g = guard(&[], &["198.51.100.9"]);
        assert!(g.validate_url("http://198.51.100.9/").is_err());
        assert!(g.validate_url("http://198.51.100.10/").is_ok());
    }
}
