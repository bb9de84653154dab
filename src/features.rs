//! NSL-KDD style categorical features.

use std::collections::HashMap;

use crate::flow::FlowAggregate;

/// Port assumed for requests that matched no flow: the web app's own listener.
pub const DEFAULT_SERVICE_PORT: u16 = 3000;

const BUILTIN_SERVICES: &[(u16, &str)] = &[
    (20, "ftp_data"),
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "domain"),
    (67, "domain_u"),
    (68, "domain_u"),
    (80, "http"),
    (110, "pop_3"),
    (119, "nntp"),
    (123, "ntp_u"),
    (143, "imap4"),
    (161, "snmp"),
    (162, "snmp"),
    (443, "http_443"),
    (993, "imap4"),
    (995, "pop_3"),
    (3000, "http"),
    (8000, "http_8001"),
    (8080, "http"),
    (8443, "http_443"),
];

const BUILTIN_PROTOCOLS: &[(u8, &str)] = &[(1, "icmp"), (6, "tcp"), (17, "udp")];

/// Destination port to service name. Unmapped ports are `other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTable(HashMap<u16, String>);

impl Default for ServiceTable {
    fn default() -> Self {
        ServiceTable(
            BUILTIN_SERVICES
                .iter()
                .map(|&(port, name)| (port, name.to_string()))
                .collect(),
        )
    }
}

impl ServiceTable {
    /// Built-in table with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<u16, String>) -> Self {
        let mut table = Self::default();
        table.0.extend(overrides.iter().map(|(&p, n)| (p, n.clone())));
        table
    }

    pub fn lookup(&self, port: u16) -> &str {
        self.0.get(&port).map(String::as_str).unwrap_or("other")
    }
}

/// IP protocol number to `protocol_type`. Unmapped numbers are `other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolTable(HashMap<u8, String>);

impl Default for ProtocolTable {
    fn default() -> Self {
        ProtocolTable(
            BUILTIN_PROTOCOLS
                .iter()
                .map(|&(proto, name)| (proto, name.to_string()))
                .collect(),
        )
    }
}

impl ProtocolTable {
    pub fn with_overrides(overrides: &HashMap<u8, String>) -> Self {
        let mut table = Self::default();
        table.0.extend(overrides.iter().map(|(&p, n)| (p, n.clone())));
        table
    }

    pub fn lookup(&self, protocol: u8) -> &str {
        self.0.get(&protocol).map(String::as_str).unwrap_or("other")
    }
}

/// Lookup tables handed to every stage that derives features.
#[derive(Debug, Clone, Default)]
pub struct FeatureTables {
    pub protocols: ProtocolTable,
    pub services: ServiceTable,
}

/// Features computed from a finished flow.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFeatures {
    pub protocol_type: String,
    pub land: u8,
    pub duration: f64,
}

impl DerivedFeatures {
    pub fn derive(flow: &FlowAggregate, protocols: &ProtocolTable) -> Self {
        DerivedFeatures {
            protocol_type: protocols.lookup(flow.protocol).to_string(),
            land: u8::from(flow.src_ip == flow.dst_ip),
            duration: flow.duration_secs(),
        }
    }
}
