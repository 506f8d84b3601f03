//! Host identity: the IP key hosts are matched on, and the local host's name.

use crate::config::HostSettings;
use std::net::{IpAddr, Ipv4Addr};

/// Canonical form of every loopback spelling.
pub const LOOPBACK: &str = "127.0.0.1";

/// Normalise an address to the form used as the host identity key.
///
/// Any loopback or unspecified address, `localhost` and `::1` become
/// `127.0.0.1`; IPv4-mapped IPv6 addresses collapse to their IPv4 form.
/// Anything that is not an address is trimmed and lowercased.
pub fn normalize_ip(raw: &str) -> String {
    let trimmed = raw.trim();
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    if unbracketed.eq_ignore_ascii_case("localhost") {
        return LOOPBACK.to_string();
    }

    match unbracketed.parse::<IpAddr>() {
        Ok(addr) => {
            let addr = match addr {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
                v4 => v4,
            };
            if addr.is_loopback() || addr.is_unspecified() {
                LOOPBACK.to_string()
            } else {
                addr.to_string()
            }
        }
        Err(_) => unbracketed.to_ascii_lowercase(),
    }
}

/// How the local machine appears in the host catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub name: String,
    /// Already normalised.
    pub ip: String,
    pub tags: Vec<String>,
}

impl HostIdentity {
    pub fn new(name: impl Into<String>, ip: &str, tags: Vec<String>) -> Self {
        Self {
            name: name.into(),
            ip: normalize_ip(ip),
            tags,
        }
    }

    /// The local machine: configured name or the OS hostname, keyed on loopback.
    pub fn local(settings: &HostSettings) -> Self {
        let name = settings.name.clone().unwrap_or_else(local_hostname);
        Self::new(name, &Ipv4Addr::LOCALHOST.to_string(), settings.tags.clone())
    }
}

fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Union of `existing` and `incoming`, keeping first-seen order.
pub fn merge_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for tag in incoming {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_forms_collapse() {
        for raw in [
            "127.0.0.1",
            "127.1.2.3",
            "localhost",
            "LocalHost",
            "::1",
            "[::1]",
            "0.0.0.0",
            "::",
            "::ffff:127.0.0.1",
            " 127.0.0.1 ",
        ] {
            assert_eq!(normalize_ip(raw), LOOPBACK, "{raw}");
        }
    }

    #[test]
    fn other_addresses_are_canonicalised() {
        assert_eq!(normalize_ip("10.0.0.5"), "10.0.0.5");
        assert_eq!(normalize_ip("::ffff:10.0.0.5"), "10.0.0.5");
        assert_eq!(normalize_ip("FE80::1"), "fe80::1");
        assert_eq!(normalize_ip("Build-Box"), "build-box");
    }

    #[test]
    fn local_identity_uses_override() {
        let settings = HostSettings {
            name: Some("dev-box".to_string()),
            tags: vec!["dev".to_string()],
        };
        let id = HostIdentity::local(&settings);
        assert_eq!(id.name, "dev-box");
        assert_eq!(id.ip, LOOPBACK);
        assert_eq!(id.tags, vec!["dev"]);
    }

    #[test]
    fn local_identity_falls_back_to_hostname() {
        let id = HostIdentity::local(&HostSettings::default());
        assert!(!id.name.is_empty());
    }

    #[test]
    fn tags_merge_without_duplicates() {
        let merged = merge_tags(
            &["a".to_string(), "b".to_string()],
            &["b".to_string(), "c".to_string()],
        );
        assert_eq!(merged, vec!["a", "b", "c"]);
    }
}
