use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::debug;
use pnet::packet::Packet as _;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use crate::error::DecodeError;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// A decoded packet header as consumed by the flow aggregator.
///
/// `src_ip`/`dst_ip` are `None` for frames without a network layer (ARP,
/// LLDP, ...). Ports are 0 unless the transport is TCP or UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub timestamp: DateTime<Utc>,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u32,
}

impl Packet {
    /// Builds an IP packet directly, for callers that decode headers elsewhere.
    pub fn ip(
        timestamp: DateTime<Utc>,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        length: u32,
    ) -> Self {
        Packet {
            timestamp,
            src_ip: Some(src_ip),
            dst_ip: Some(dst_ip),
            protocol,
            src_port,
            dst_port,
            length,
        }
    }

    fn without_network(timestamp: DateTime<Utc>, length: u32) -> Self {
        Packet {
            timestamp,
            src_ip: None,
            dst_ip: None,
            protocol: 0,
            src_port: 0,
            dst_port: 0,
            length,
        }
    }
}

/// Link-layer framing of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
}

impl LinkType {
    /// Maps a libpcap DLT value to a supported framing.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),
            12 | 101 => Some(LinkType::RawIp),
            _ => None,
        }
    }
}

/// Decodes one captured frame. `length` is the on-wire length from the
/// record header and becomes the packet's byte count.
pub fn decode_frame(
    data: &[u8],
    link: LinkType,
    timestamp: DateTime<Utc>,
    length: u32,
) -> Result<Packet, DecodeError> {
    match link {
        LinkType::Ethernet => {
            let eth = EthernetPacket::new(data).ok_or(DecodeError::Ethernet)?;
            match eth.get_ethertype() {
                EtherTypes::Ipv4 => decode_ipv4(eth.payload(), timestamp, length),
                EtherTypes::Ipv6 => decode_ipv6(eth.payload(), timestamp, length),
                other => {
                    debug!("Non-IP EtherType: {:?}", other);
                    Ok(Packet::without_network(timestamp, length))
                }
            }
        }
        LinkType::RawIp => match data.first().map(|b| b >> 4) {
            Some(4) => decode_ipv4(data, timestamp, length),
            Some(6) => decode_ipv6(data, timestamp, length),
            _ => Ok(Packet::without_network(timestamp, length)),
        },
    }
}

fn decode_ipv4(
    data: &[u8],
    timestamp: DateTime<Utc>,
    length: u32,
) -> Result<Packet, DecodeError> {
    let ip = Ipv4Packet::new(data).ok_or(DecodeError::Ipv4)?;
    let proto = ip.get_next_level_protocol();
    let (src_port, dst_port) = transport_ports(proto, ip.payload())?;
    Ok(Packet::ip(
        timestamp,
        IpAddr::V4(ip.get_source()),
        src_port,
        IpAddr::V4(ip.get_destination()),
        dst_port,
        proto.0,
        length,
    ))
}

fn decode_ipv6(
    data: &[u8],
    timestamp: DateTime<Utc>,
    length: u32,
) -> Result<Packet, DecodeError> {
    let ip = Ipv6Packet::new(data).ok_or(DecodeError::Ipv6)?;
    let proto = ip.get_next_header();
    let (src_port, dst_port) = transport_ports(proto, ip.payload())?;
    Ok(Packet::ip(
        timestamp,
        IpAddr::V6(ip.get_source()),
        src_port,
        IpAddr::V6(ip.get_destination()),
        dst_port,
        proto.0,
        length,
    ))
}

fn transport_ports(proto: IpNextHeaderProtocol, payload: &[u8]) -> Result<(u16, u16), DecodeError> {
    if proto == IpNextHeaderProtocols::Tcp {
        let tcp = TcpPacket::new(payload).ok_or(DecodeError::Tcp)?;
        Ok((tcp.get_source(), tcp.get_destination()))
    } else if proto == IpNextHeaderProtocols::Udp {
        let udp = UdpPacket::new(payload).ok_or(DecodeError::Udp)?;
        Ok((udp.get_source(), udp.get_destination()))
    } else {
        Ok((0, 0))
    }
}
