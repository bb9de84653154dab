//! Bidirectional flow identities and the streaming aggregator.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::DecodeError;
use crate::packet::{PROTO_TCP, PROTO_UDP, Packet};

/// One side of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port }
    }
}

/// Direction-agnostic flow identity. Endpoint `a` always sorts at or before
/// endpoint `b` by (address, port), so `A -> B` and `B -> A` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub a: Endpoint,
    pub b: Endpoint,
    pub protocol: u8,
}

impl FlowKey {
    /// Canonicalises an addressing tuple. Ports are ignored (forced to 0)
    /// unless the protocol is TCP or UDP, so all ICMP between two hosts is
    /// one flow.
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        let (src_port, dst_port) = if has_ports(protocol) {
            (src_port, dst_port)
        } else {
            (0, 0)
        };
        let src = Endpoint::new(src_ip, src_port);
        let dst = Endpoint::new(dst_ip, dst_port);
        if src <= dst {
            FlowKey {
                a: src,
                b: dst,
                protocol,
            }
        } else {
            FlowKey {
                a: dst,
                b: src,
                protocol,
            }
        }
    }

    /// Returns `None` for packets without a network layer.
    pub fn from_packet(pkt: &Packet) -> Option<Self> {
        match (pkt.src_ip, pkt.dst_ip) {
            (Some(src), Some(dst)) => Some(FlowKey::new(
                src,
                pkt.src_port,
                dst,
                pkt.dst_port,
                pkt.protocol,
            )),
            _ => None,
        }
    }
}

fn has_ports(protocol: u8) -> bool {
    protocol == PROTO_TCP || protocol == PROTO_UDP
}

/// Running statistics for one flow.
///
/// The source/destination fields are taken from the first packet seen for
/// the flow and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowAggregate {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub src_bytes: u64,
    pub dst_bytes: u64,
}

impl FlowAggregate {
    /// Starts a flow from its first packet. `None` without a network layer.
    pub fn from_packet(pkt: &Packet) -> Option<Self> {
        let (src_ip, dst_ip) = (pkt.src_ip?, pkt.dst_ip?);
        let (src_port, dst_port) = if has_ports(pkt.protocol) {
            (pkt.src_port, pkt.dst_port)
        } else {
            (0, 0)
        };
        Some(FlowAggregate {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol: pkt.protocol,
            start_time: pkt.timestamp,
            end_time: pkt.timestamp,
            total_packets: 1,
            total_bytes: pkt.length as u64,
            src_bytes: pkt.length as u64,
            dst_bytes: 0,
        })
    }

    /// Folds a later packet of the same flow into the counters.
    pub fn update(&mut self, pkt: &Packet) {
        if pkt.timestamp < self.start_time {
            self.start_time = pkt.timestamp;
        }
        if pkt.timestamp > self.end_time {
            self.end_time = pkt.timestamp;
        }
        let len = pkt.length as u64;
        self.total_packets += 1;
        self.total_bytes += len;
        if pkt.src_ip == Some(self.src_ip) {
            self.src_bytes += len;
        } else {
            self.dst_bytes += len;
        }
    }

    /// Merges a partial aggregate of the same flow built from another slice
    /// of packets. Directional bytes are swapped when the two partials fixed
    /// opposite sources.
    pub fn absorb(&mut self, other: &FlowAggregate) {
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.total_packets += other.total_packets;
        self.total_bytes += other.total_bytes;
        if other.src_ip == self.src_ip {
            self.src_bytes += other.src_bytes;
            self.dst_bytes += other.dst_bytes;
        } else {
            self.src_bytes += other.dst_bytes;
            self.dst_bytes += other.src_bytes;
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.protocol,
        )
    }

    pub fn source(&self) -> Endpoint {
        Endpoint::new(self.src_ip, self.src_port)
    }

    pub fn destination(&self) -> Endpoint {
        Endpoint::new(self.dst_ip, self.dst_port)
    }

    /// Seconds between first and last packet.
    pub fn duration_secs(&self) -> f64 {
        let delta = self.end_time.signed_duration_since(self.start_time);
        delta.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
    }
}

/// Counters describing how much of a packet source made it into a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationStats {
    /// Records pulled from the source, decodable or not
    pub packets_read: u64,
    pub packets_aggregated: u64,
    /// Frames with no network layer
    pub non_ip: u64,
    pub decode_errors: u64,
    /// Set when consumption stopped because the packet cap was reached
    pub capped: bool,
}

impl AggregationStats {
    pub fn skipped(&self) -> u64 {
        self.non_ip + self.decode_errors
    }

    pub fn combine(&mut self, other: &AggregationStats) {
        self.packets_read += other.packets_read;
        self.packets_aggregated += other.packets_aggregated;
        self.non_ip += other.non_ip;
        self.decode_errors += other.decode_errors;
        self.capped |= other.capped;
    }
}

/// In-memory aggregate table, one entry per [`FlowKey`], kept in the order
/// flows were first seen. Memory grows with the number of flows only.
#[derive(Debug, Default, Clone)]
pub struct FlowTable {
    slots: HashMap<FlowKey, usize>,
    flows: Vec<FlowAggregate>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowAggregate> {
        self.flows.iter()
    }

    /// Adds one packet. Returns `false` if the packet has no flow key.
    pub fn observe(&mut self, pkt: &Packet) -> bool {
        let Some(key) = FlowKey::from_packet(pkt) else {
            return false;
        };
        match self.slots.entry(key) {
            Entry::Occupied(slot) => {
                self.flows[*slot.get()].update(pkt);
                true
            }
            Entry::Vacant(slot) => match FlowAggregate::from_packet(pkt) {
                Some(flow) => {
                    slot.insert(self.flows.len());
                    self.flows.push(flow);
                    true
                }
                None => false,
            },
        }
    }

    /// Consumes a packet source in a single pass. Undecodable records are
    /// counted and skipped. With `limit` set, no more than that many records
    /// are pulled from the source; the table stays valid.
    pub fn ingest<I>(&mut self, source: I, limit: Option<u64>) -> AggregationStats
    where
        I: IntoIterator<Item = Result<Packet, DecodeError>>,
    {
        let mut stats = AggregationStats::default();
        let mut records = source.into_iter();
        loop {
            if limit.is_some_and(|cap| stats.packets_read >= cap) {
                stats.capped = true;
                info!("Packet cap of {} reached, stopping early", stats.packets_read);
                break;
            }
            let Some(item) = records.next() else {
                break;
            };
            stats.packets_read += 1;
            match item {
                Ok(pkt) => {
                    if self.observe(&pkt) {
                        stats.packets_aggregated += 1;
                    } else {
                        stats.non_ip += 1;
                    }
                }
                Err(e) => {
                    stats.decode_errors += 1;
                    warn!("Skipping packet {}: {}", stats.packets_read, e);
                }
            }
            if stats.packets_read % 10000 == 0 {
                info!("Processed {} packets...", stats.packets_read);
            }
        }
        debug!(
            "Ingested {} packets into {} flows",
            stats.packets_aggregated,
            self.len()
        );
        stats
    }

    /// Reduces another partial table into this one by flow key. Flows new to
    /// this table are appended in the other table's order.
    pub fn merge(&mut self, other: FlowTable) {
        for flow in other.flows {
            match self.slots.entry(flow.key()) {
                Entry::Occupied(slot) => self.flows[*slot.get()].absorb(&flow),
                Entry::Vacant(slot) => {
                    slot.insert(self.flows.len());
                    self.flows.push(flow);
                }
            }
        }
    }

    /// Finalises the table; flows come out in first-seen order.
    pub fn into_flows(self) -> Vec<FlowAggregate> {
        self.flows
    }
}

impl FromIterator<Packet> for FlowTable {
    fn from_iter<T: IntoIterator<Item = Packet>>(iter: T) -> Self {
        let mut table = FlowTable::new();
        for pkt in iter {
            table.observe(&pkt);
        }
        table
    }
}
