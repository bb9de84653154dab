use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use log::warn;
use serde::Serialize;

use crate::l7::strip_mapped_prefix;

/// Ground-truth class of a request. Variants sort alphabetically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Attack,
    Normal,
    Unknown,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Attack => "attack",
            Label::Normal => "normal",
            Label::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AddrRule {
    Exact(String),
    Subnet(IpNetwork),
}

/// Set of addresses parsed from a comma-separated list. An entry containing
/// `/` is a CIDR network; anything else must match the address text exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrSet {
    rules: Vec<AddrRule>,
}

impl AddrSet {
    pub fn parse(list: &str) -> Self {
        let rules = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                if entry.contains('/') {
                    match IpNetwork::from_str(entry) {
                        Ok(net) => Some(AddrRule::Subnet(net)),
                        Err(e) => {
                            warn!("Ignoring invalid network '{}': {}", entry, e);
                            None
                        }
                    }
                } else {
                    Some(AddrRule::Exact(strip_mapped_prefix(entry).to_string()))
                }
            })
            .collect();
        AddrSet { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn contains(&self, addr: &str) -> bool {
        let parsed = addr.parse::<IpAddr>().ok();
        self.rules.iter().any(|rule| match rule {
            AddrRule::Exact(s) => s == addr,
            AddrRule::Subnet(net) => parsed.is_some_and(|ip| net.contains(ip)),
        })
    }
}

/// Assigns labels by source address. The attacker set is consulted first,
/// so an address listed in both sets is an attack.
#[derive(Debug, Clone, Default)]
pub struct Labeler {
    attackers: AddrSet,
    normals: AddrSet,
}

impl Labeler {
    pub fn new(attackers: AddrSet, normals: AddrSet) -> Self {
        if attackers.is_empty() && normals.is_empty() {
            warn!("No attacker or normal addresses configured; every record will be labelled unknown");
        }
        Labeler { attackers, normals }
    }

    pub fn from_lists(attacker_list: &str, normal_list: &str) -> Self {
        Self::new(AddrSet::parse(attacker_list), AddrSet::parse(normal_list))
    }

    pub fn label(&self, addr: &str) -> Label {
        let addr = strip_mapped_prefix(addr.trim());
        if self.attackers.contains(addr) {
            Label::Attack
        } else if self.normals.contains(addr) {
            Label::Normal
        } else {
            Label::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_labels() {
        let labeler = Labeler::from_lists("192.168.1.100", "192.168.1.200, 192.168.1.201");
        assert_eq!(labeler.label("192.168.1.100"), Label::Attack);
        assert_eq!(labeler.label("192.168.1.201"), Label::Normal);
        assert_eq!(labeler.label("::ffff:192.168.1.200"), Label::Normal);
        assert_eq!(labeler.label("10.9.9.9"), Label::Unknown);
    }

    #[test]
    fn test_attacker_precedence() {
        let labeler = Labeler::from_lists("10.0.0.5,10.0.0.6", "10.0.0.6");
        assert_eq!(labeler.label("10.0.0.6"), Label::Attack);
    }

    #[test]
    fn test_list_parsing_tolerates_whitespace_and_empties() {
        let set = AddrSet::parse(" 10.0.0.1 ,, 10.0.0.2,  ");
        assert_eq!(set.len(), 2);
        assert!(set.contains("10.0.0.2"));
        assert!(AddrSet::parse("").is_empty());
    }

    #[test]
    fn test_subnet_entries() {
        let labeler = Labeler::from_lists("172.16.0.0/12", "10.0.0.0/8, 10.1.2.3");
        assert_eq!(labeler.label("172.20.1.1"), Label::Attack);
        assert_eq!(labeler.label("10.200.0.1"), Label::Normal);
        assert_eq!(labeler.label("192.168.0.1"), Label::Unknown);
        let bad = AddrSet::parse("10.0.0.0/99");
        assert!(bad.is_empty());
    }

    #[test]
    fn test_nothing_configured() {
        let labeler = Labeler::from_lists("", "");
        assert_eq!(labeler.label("10.0.0.1"), Label::Unknown);
    }

    #[test]
    fn test_label_display() {
        assert_eq!(Label::Attack.to_string(), "attack");
        assert!(Label::Attack < Label::Normal && Label::Normal < Label::Unknown);
    }
}
