use crate::flow::{FlowKey, FlowTable, TransportProtocol};
use crate::olsr::state::NodeStore;
use crate::olsr::{self, AddressFamily};
use chrono::{DateTime, Utc};
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Top-level observation state threaded through every capture callback and
/// timer body.
pub struct Engine {
    pub flows: FlowTable,
    pub nodes: NodeStore,
    pub parse_errors: u64,
    olsr_port: u16,
}

struct EthernetHeader {
    ethertype: u16,
}

struct Ipv4Header {
    header_len: usize,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

struct TransportHeader {
    src_port: u16,
    dst_port: u16,
    /// SYN set and ACK clear; only meaningful for TCP.
    opening: bool,
}

fn ethernet_header(input: &[u8]) -> IResult<&[u8], EthernetHeader> {
    let (input, (_dst, _src, ethertype)) = tuple((take(6usize), take(6usize), be_u16))(input)?;
    Ok((input, EthernetHeader { ethertype }))
}

fn ipv4_header(input: &[u8]) -> IResult<&[u8], Ipv4Header> {
    let (rest, (version_ihl, _tos, _total_len, _id, _frag, _ttl, protocol, _csum)) =
        tuple((be_u8, be_u8, be_u16, be_u16, be_u16, be_u8, be_u8, be_u16))(input)?;
    let (rest, src) = take(4usize)(rest)?;
    let (_, dst) = take(4usize)(rest)?;

    Ok((
        input,
        Ipv4Header {
            header_len: ((version_ihl & 0x0f) as usize) * 4,
            protocol,
            src: Ipv4Addr::new(src[0], src[1], src[2], src[3]),
            dst: Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]),
        },
    ))
}

fn tcp_header(input: &[u8]) -> IResult<&[u8], TransportHeader> {
    let (rest, header) = take(20usize)(input)?;
    let (_, (src_port, dst_port)) = tuple((be_u16, be_u16))(header)?;
    let flags = header[13];
    let syn = flags & 0x02 != 0;
    let ack = flags & 0x10 != 0;

    Ok((
        rest,
        TransportHeader {
            src_port,
            dst_port,
            opening: syn && !ack,
        },
    ))
}

fn udp_header(input: &[u8]) -> IResult<&[u8], TransportHeader> {
    let (input, (src_port, dst_port, _len, _csum)) =
        tuple((be_u16, be_u16, be_u16, be_u16))(input)?;
    Ok((
        input,
        TransportHeader {
            src_port,
            dst_port,
            opening: true,
        },
    ))
}

fn transport_header(
    transport: TransportProtocol,
    l4: &[u8],
) -> Result<(&[u8], TransportHeader), ()> {
    let parsed = match transport {
        TransportProtocol::Tcp => tcp_header(l4),
        TransportProtocol::Udp => udp_header(l4),
    };

    parsed.map_err(|_| {
        tracing::error!("packet too short to carry its transport header");
    })
}

/// Walks the IPv6 extension-header chain until a transport protocol or a
/// terminator. Returns the transport protocol and its payload offset, or
/// `Ok(None)` for chains that end without a tracked transport.
fn ipv6_transport(mut next_header: u8, payload: &[u8]) -> Result<Option<(u8, usize)>, ()> {
    let mut offset = 0;

    loop {
        match next_header {
            IPPROTO_TCP | IPPROTO_UDP => return Ok(Some((next_header, offset))),
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                let header = payload.get(offset..offset + 2).ok_or(())?;
                next_header = header[0];
                offset += 8 * (header[1] as usize + 1);
            }
            // fragment header is fixed size
            44 => {
                let header = payload.get(offset..offset + 8).ok_or(())?;
                next_header = header[0];
                offset += 8;
            }
            // authentication header counts in 4 byte units
            51 => {
                let header = payload.get(offset..offset + 2).ok_or(())?;
                next_header = header[0];
                offset += 4 * (header[1] as usize + 2);
            }
            // no next header, or a transport we do not track
            _ => return Ok(None),
        }

        if offset > payload.len() {
            return Err(());
        }
    }
}

impl Engine {
    pub fn new(flows: FlowTable, olsr_port: u16) -> Self {
        Self {
            flows,
            nodes: NodeStore::new(),
            parse_errors: 0,
            olsr_port,
        }
    }

    /// Classifies one captured frame and feeds the flow table and, for OLSR
    /// traffic, the node store. Truncated or malformed frames increment the
    /// parse-error counter and leave all state untouched.
    pub fn process_frame(&mut self, frame: &[u8], wire_len: u64, now: DateTime<Utc>) {
        if self.classify(frame, wire_len, now).is_err() {
            self.parse_errors += 1;
        }
    }

    fn classify(&mut self, frame: &[u8], wire_len: u64, now: DateTime<Utc>) -> Result<(), ()> {
        let (payload, ethernet) = ethernet_header(frame).map_err(|_| {
            tracing::error!("frame too short to be a valid ethernet frame");
        })?;

        match ethernet.ethertype {
            ETHERTYPE_IPV4 => self.classify_ipv4(payload, wire_len, now),
            ETHERTYPE_IPV6 => self.classify_ipv6(payload, wire_len, now),
            other => {
                tracing::trace!("ignoring unsupported ethertype {:#06x}", other);
                Ok(())
            }
        }
    }

    fn classify_ipv4(&mut self, packet: &[u8], wire_len: u64, now: DateTime<Utc>) -> Result<(), ()> {
        let (_, header) = ipv4_header(packet).map_err(|_| {
            tracing::error!("packet too short to be a valid IPv4 packet");
        })?;

        if header.header_len < 20 || header.header_len > packet.len() {
            tracing::error!("IPv4 payload points beyond capture end");
            return Err(());
        }
        let l4 = &packet[header.header_len..];

        let transport = match header.protocol {
            IPPROTO_TCP => TransportProtocol::Tcp,
            IPPROTO_UDP => TransportProtocol::Udp,
            _ => return Ok(()),
        };

        let (olsr_payload, l4_header) = transport_header(transport, l4)?;

        let key = FlowKey::new(
            transport,
            header.src,
            l4_header.src_port,
            header.dst,
            l4_header.dst_port,
        );
        self.flows.observe_v4(key, l4_header.opening, wire_len, now);

        if transport == TransportProtocol::Udp && l4_header.dst_port == self.olsr_port {
            self.decode_olsr(olsr_payload, AddressFamily::Ipv4, now)?;
        }

        Ok(())
    }

    fn classify_ipv6(&mut self, packet: &[u8], wire_len: u64, now: DateTime<Utc>) -> Result<(), ()> {
        if packet.len() < 40 {
            tracing::error!("packet too short to be a valid IPv6 packet");
            return Err(());
        }

        let next_header = packet[6];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&packet[8..24]);
        dst.copy_from_slice(&packet[24..40]);
        let payload = &packet[40..];

        let (protocol, offset) = match ipv6_transport(next_header, payload) {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(()),
            Err(()) => {
                tracing::error!("malformed IPv6 extension header chain");
                return Err(());
            }
        };

        let transport = match protocol {
            IPPROTO_TCP => TransportProtocol::Tcp,
            _ => TransportProtocol::Udp,
        };

        let (olsr_payload, l4_header) = transport_header(transport, &payload[offset..])?;

        let key = FlowKey::new(
            transport,
            Ipv6Addr::from(src),
            l4_header.src_port,
            Ipv6Addr::from(dst),
            l4_header.dst_port,
        );
        self.flows.observe_v6(key, l4_header.opening, wire_len, now);

        if transport == TransportProtocol::Udp && l4_header.dst_port == self.olsr_port {
            self.decode_olsr(olsr_payload, AddressFamily::Ipv6, now)?;
        }

        Ok(())
    }

    fn decode_olsr(
        &mut self,
        payload: &[u8],
        family: AddressFamily,
        now: DateTime<Utc>,
    ) -> Result<(), ()> {
        match olsr::parse_packet(payload, family) {
            Ok(outcome) => {
                self.parse_errors += outcome.parse_errors;
                for message in &outcome.messages {
                    self.nodes.apply(message, now);
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!("dropping undecodable OLSR packet: {}", err);
                Err(())
            }
        }
    }
}
