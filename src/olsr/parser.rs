use super::AddressFamily;
use chrono::Duration;
use nom::bytes::complete::take;
use nom::combinator::{all_consuming, map, verify};
use nom::multi::{length_data, many0};
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const HELLO_MESSAGE: u8 = 1;
pub const TC_MESSAGE: u8 = 2;
pub const MID_MESSAGE: u8 = 3;
pub const HNA_MESSAGE: u8 = 4;
pub const LQ_HELLO_MESSAGE: u8 = 201;
pub const LQ_TC_MESSAGE: u8 = 202;

const PACKET_HEADER_LEN: usize = 4;
// type(1) vtime(1) size(2), before the originator
const MESSAGE_HEADER_LEN: usize = 4;
// originator + ttl(1) hops(1) seqno(2)
fn message_fixed_len(family: AddressFamily) -> usize {
    MESSAGE_HEADER_LEN + family.addr_len() + 4
}

/// Expands the one-byte mantissa/exponent validity-time encoding:
/// mantissa in the high nibble, exponent in the low nibble,
/// seconds = (16 + mant) * 2^exp / 256.
pub fn decode_vtime(byte: u8) -> Duration {
    let mant = u64::from(byte >> 4);
    let exp = byte & 0x0f;
    Duration::milliseconds((((16 + mant) << exp) * 1000 / 256) as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloNeighbor {
    pub addr: IpAddr,
    pub lq: u8,
    pub nlq: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcNeighbor {
    pub addr: IpAddr,
    pub lq: u8,
    pub nlq: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Hello { neighbors: Vec<HelloNeighbor> },
    Tc { ansn: u16, neighbors: Vec<TcNeighbor> },
    Mid { aliases: Vec<IpAddr> },
    Hna { networks: Vec<(IpAddr, u8)> },
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlsrMessage {
    pub originator: IpAddr,
    pub vtime: Duration,
    pub ttl: u8,
    pub hops: u8,
    pub seqno: u16,
    pub body: MessageBody,
}

#[derive(Debug)]
pub struct PacketOutcome {
    pub seqno: u16,
    pub messages: Vec<OlsrMessage>,
    /// Messages whose inner payload failed to decode. The enclosing packet
    /// is still advanced by each message's declared size, so one bad message
    /// never corrupts its neighbors.
    pub parse_errors: u64,
}

fn ip_addr(family: AddressFamily) -> impl Fn(&[u8]) -> IResult<&[u8], IpAddr> {
    move |input| match family {
        AddressFamily::Ipv4 => {
            let (input, bytes) = take(4usize)(input)?;
            Ok((
                input,
                IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
            ))
        }
        AddressFamily::Ipv6 => {
            let (input, bytes) = take(16usize)(input)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok((input, IpAddr::V6(Ipv6Addr::from(octets))))
        }
    }
}

fn hello_neighbor(
    family: AddressFamily,
    link_quality: bool,
) -> impl Fn(&[u8]) -> IResult<&[u8], HelloNeighbor> {
    move |input| {
        let (input, addr) = ip_addr(family)(input)?;
        if !link_quality {
            return Ok((input, HelloNeighbor { addr, lq: 0, nlq: 0 }));
        }
        let (input, (lq, nlq, _reserved)) = tuple((be_u8, be_u8, take(2usize)))(input)?;
        Ok((input, HelloNeighbor { addr, lq, nlq }))
    }
}

/// reserved(2) htime(1) willingness(1), then link-code blocks of
/// `{link_code(1) reserved(1) block_size(2)}` framing `block_size - 4`
/// bytes of neighbor entries.
fn parse_hello(
    payload: &[u8],
    family: AddressFamily,
    link_quality: bool,
) -> IResult<&[u8], MessageBody> {
    let (mut input, _) = tuple((be_u16, be_u8, be_u8))(payload)?;

    let mut neighbors = Vec::new();
    while !input.is_empty() {
        let (rest, _) = tuple((be_u8, be_u8))(input)?;
        let (rest, block) =
            length_data(map(verify(be_u16, |&size: &u16| size >= 4), |size| size - 4))(rest)?;
        let (_, mut entries) = all_consuming(many0(hello_neighbor(family, link_quality)))(block)?;
        neighbors.append(&mut entries);
        input = rest;
    }

    Ok((input, MessageBody::Hello { neighbors }))
}

fn tc_neighbor(
    family: AddressFamily,
    link_quality: bool,
) -> impl Fn(&[u8]) -> IResult<&[u8], TcNeighbor> {
    move |input| {
        let (input, addr) = ip_addr(family)(input)?;
        if !link_quality {
            return Ok((input, TcNeighbor { addr, lq: 0, nlq: 0 }));
        }
        let (input, (lq, nlq, _reserved)) = tuple((be_u8, be_u8, take(2usize)))(input)?;
        Ok((input, TcNeighbor { addr, lq, nlq }))
    }
}

/// ansn(2) lower_border(1) upper_border(1), two further reserved bytes for
/// the link-quality variant, then advertised neighbors.
fn parse_tc(
    payload: &[u8],
    family: AddressFamily,
    link_quality: bool,
) -> IResult<&[u8], MessageBody> {
    let (input, ansn) = be_u16(payload)?;
    let (input, _borders) = take(2usize)(input)?;
    let input = if link_quality {
        take(2usize)(input)?.0
    } else {
        input
    };

    let (input, neighbors) = all_consuming(many0(tc_neighbor(family, link_quality)))(input)?;
    Ok((input, MessageBody::Tc { ansn, neighbors }))
}

fn parse_mid(payload: &[u8], family: AddressFamily) -> IResult<&[u8], MessageBody> {
    let (input, aliases) = all_consuming(many0(ip_addr(family)))(payload)?;
    Ok((input, MessageBody::Mid { aliases }))
}

fn prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(mask) => u32::from(mask).leading_ones() as u8,
        IpAddr::V6(mask) => u128::from(mask).leading_ones() as u8,
    }
}

fn parse_hna(payload: &[u8], family: AddressFamily) -> IResult<&[u8], MessageBody> {
    let (input, pairs) =
        all_consuming(many0(tuple((ip_addr(family), ip_addr(family)))))(payload)?;
    let networks = pairs
        .into_iter()
        .map(|(network, mask)| (network, prefix_len(mask)))
        .collect();
    Ok((input, MessageBody::Hna { networks }))
}

/// originator ttl(1) hops(1) seqno(2) + type-specific payload.
fn parse_message_body(
    input: &[u8],
    family: AddressFamily,
    message_type: u8,
    vtime: Duration,
) -> IResult<&[u8], OlsrMessage> {
    let (payload, (originator, ttl, hops, seqno)) =
        tuple((ip_addr(family), be_u8, be_u8, be_u16))(input)?;

    let (rest, body) = match message_type {
        HELLO_MESSAGE => parse_hello(payload, family, false)?,
        LQ_HELLO_MESSAGE => parse_hello(payload, family, true)?,
        TC_MESSAGE => parse_tc(payload, family, false)?,
        LQ_TC_MESSAGE => parse_tc(payload, family, true)?,
        MID_MESSAGE => parse_mid(payload, family)?,
        HNA_MESSAGE => parse_hna(payload, family)?,
        other => (&payload[payload.len()..], MessageBody::Other(other)),
    };

    Ok((
        rest,
        OlsrMessage {
            originator,
            vtime,
            ttl,
            hops,
            seqno,
            body,
        },
    ))
}

/// Parses one OLSR packet: `size(2) seqno(2)` followed by length-prefixed
/// messages `type(1) vtime(1) size(2) orig ttl(1) hops(1) seqno(2) payload`.
///
/// Messages are length-framed by the outer `size` field, so a payload that
/// fails to decode is counted and skipped without disturbing the messages
/// around it.
pub fn parse_packet(input: &[u8], family: AddressFamily) -> anyhow::Result<PacketOutcome> {
    let (rest, (size, seqno)) = tuple((be_u16, be_u16))(input)
        .map_err(|err: nom::Err<nom::error::Error<&[u8]>>| {
            anyhow::anyhow!("truncated OLSR packet header: {:?}", err)
        })?;

    // Trust the shorter of the declared size and the captured payload.
    let declared = (size as usize).saturating_sub(PACKET_HEADER_LEN);
    let mut rest = &rest[..declared.min(rest.len())];

    let mut messages = Vec::new();
    let mut parse_errors = 0;

    while !rest.is_empty() {
        let header: IResult<&[u8], (u8, u8, u16)> = tuple((be_u8, be_u8, be_u16))(rest);
        let (message_type, vtime_byte, message_size) = match header {
            Ok((_, header)) => header,
            Err(_) => {
                parse_errors += 1;
                break;
            }
        };

        let total = message_size as usize;
        if total == 0 || total > rest.len() {
            // The declared size cannot advance the cursor.
            parse_errors += 1;
            break;
        }

        if total < message_fixed_len(family) {
            // Too small to hold a message header, but the length-prefixed
            // framing still says where the next message starts.
            parse_errors += 1;
            rest = &rest[total..];
            continue;
        }

        let body = &rest[MESSAGE_HEADER_LEN..total];
        match parse_message_body(body, family, message_type, decode_vtime(vtime_byte)) {
            Ok((_, message)) => messages.push(message),
            Err(err) => {
                tracing::trace!("dropping undecodable OLSR message: {:?}", err);
                parse_errors += 1;
            }
        }

        rest = &rest[total..];
    }

    Ok(PacketOutcome {
        seqno,
        messages,
        parse_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    /// Wraps message bytes into a packet with a correct outer size field.
    fn packet(messages: &[Vec<u8>]) -> Vec<u8> {
        let body_len: usize = messages.iter().map(Vec::len).sum();
        let mut out = Vec::new();
        out.extend_from_slice(&((body_len + 4) as u16).to_be_bytes());
        out.extend_from_slice(&7u16.to_be_bytes()); // packet seqno
        for message in messages {
            out.extend_from_slice(message);
        }
        out
    }

    fn message(message_type: u8, vtime: u8, originator: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(message_type);
        out.push(vtime);
        out.extend_from_slice(&((12 + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&originator);
        out.push(64); // ttl
        out.push(0); // hops
        out.extend_from_slice(&1u16.to_be_bytes()); // message seqno
        out.extend_from_slice(payload);
        out
    }

    fn hello_payload(neighbors: &[[u8; 4]]) -> Vec<u8> {
        let mut out = vec![0, 0, 0x86, 3]; // reserved, htime, willingness
        out.push(6); // link code
        out.push(0);
        out.extend_from_slice(&((4 + neighbors.len() * 4) as u16).to_be_bytes());
        for neighbor in neighbors {
            out.extend_from_slice(neighbor);
        }
        out
    }

    #[test]
    fn vtime_decodes_per_mantissa_table() {
        // mantissa 8, exponent 6: (16 + 8) * 2^6 / 256 = 6 s
        assert_eq!(decode_vtime(0x86), Duration::seconds(6));
        // mantissa 0, exponent 4: 16 * 16 / 256 = 1 s
        assert_eq!(decode_vtime(0x04), Duration::seconds(1));
        // mantissa 7, exponent 8: 23 * 256 / 256 = 23 s
        assert_eq!(decode_vtime(0x78), Duration::seconds(23));
    }

    #[test]
    fn hello_neighbors_are_decoded() {
        let buf = packet(&[message(
            HELLO_MESSAGE,
            0x86,
            [10, 0, 0, 9],
            &hello_payload(&[[10, 0, 0, 10], [10, 0, 0, 11]]),
        )]);

        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        assert_eq!(outcome.parse_errors, 0);
        assert_eq!(outcome.seqno, 7);
        assert_eq!(outcome.messages.len(), 1);

        let message = &outcome.messages[0];
        assert_eq!(message.originator, v4(10, 0, 0, 9));
        assert_eq!(message.vtime, Duration::seconds(6));
        match &message.body {
            MessageBody::Hello { neighbors } => {
                assert_eq!(neighbors.len(), 2);
                assert_eq!(neighbors[0].addr, v4(10, 0, 0, 10));
                assert_eq!(neighbors[1].addr, v4(10, 0, 0, 11));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn lq_hello_carries_link_qualities() {
        let mut payload = vec![0, 0, 0x86, 3];
        payload.push(6);
        payload.push(0);
        payload.extend_from_slice(&12u16.to_be_bytes()); // 4 + addr + lq block
        payload.extend_from_slice(&[10, 0, 0, 10]);
        payload.extend_from_slice(&[200, 150, 0, 0]); // lq, nlq, reserved

        let buf = packet(&[message(LQ_HELLO_MESSAGE, 0x86, [10, 0, 0, 9], &payload)]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        match &outcome.messages[0].body {
            MessageBody::Hello { neighbors } => {
                assert_eq!(neighbors[0].lq, 200);
                assert_eq!(neighbors[0].nlq, 150);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn lq_tc_carries_ansn_and_neighbors() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&260u16.to_be_bytes()); // ansn
        payload.extend_from_slice(&[0, 0]); // borders
        payload.extend_from_slice(&[0, 0]); // reserved (LQ variant)
        payload.extend_from_slice(&[10, 0, 0, 20]);
        payload.extend_from_slice(&[255, 255, 0, 0]);

        let buf = packet(&[message(LQ_TC_MESSAGE, 0x86, [10, 0, 0, 9], &payload)]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        match &outcome.messages[0].body {
            MessageBody::Tc { ansn, neighbors } => {
                assert_eq!(*ansn, 260);
                assert_eq!(neighbors[0].addr, v4(10, 0, 0, 20));
                assert_eq!(neighbors[0].lq, 255);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn hna_netmask_becomes_prefix_length() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[192, 168, 1, 0]);
        payload.extend_from_slice(&[255, 255, 255, 0]);
        payload.extend_from_slice(&[10, 1, 0, 0]);
        payload.extend_from_slice(&[255, 255, 0, 0]);

        let buf = packet(&[message(HNA_MESSAGE, 0x86, [10, 0, 0, 9], &payload)]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        match &outcome.messages[0].body {
            MessageBody::Hna { networks } => {
                assert_eq!(networks[0], (v4(192, 168, 1, 0), 24));
                assert_eq!(networks[1], (v4(10, 1, 0, 0), 16));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn mid_aliases_are_decoded() {
        let payload = [172u8, 16, 0, 1, 172, 16, 1, 1];
        let buf = packet(&[message(MID_MESSAGE, 0x86, [10, 0, 0, 9], &payload)]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        match &outcome.messages[0].body {
            MessageBody::Mid { aliases } => {
                assert_eq!(aliases, &[v4(172, 16, 0, 1), v4(172, 16, 1, 1)]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_type_is_skipped_intact() {
        let buf = packet(&[
            message(99, 0x86, [10, 0, 0, 9], &[1, 2, 3, 4, 5]),
            message(MID_MESSAGE, 0x86, [10, 0, 0, 9], &[172, 16, 0, 1]),
        ]);

        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        assert_eq!(outcome.parse_errors, 0);
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[0].body, MessageBody::Other(99));
        assert!(matches!(outcome.messages[1].body, MessageBody::Mid { .. }));
    }

    #[test]
    fn bad_message_does_not_corrupt_earlier_ones() {
        let hello = message(
            HELLO_MESSAGE,
            0x86,
            [10, 0, 0, 9],
            &hello_payload(&[[10, 0, 0, 10]]),
        );
        // Declares size 4 but the fixed message header alone needs 12 bytes.
        let broken = vec![HELLO_MESSAGE, 0x86, 0, 4];

        let buf = packet(&[hello, broken]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();

        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.parse_errors, 1);
        assert!(matches!(outcome.messages[0].body, MessageBody::Hello { .. }));
    }

    #[test]
    fn walk_recovers_past_an_undersized_message() {
        // The length-prefixed framing must cost only the bad message, never
        // the well-formed ones behind it.
        let broken = vec![HELLO_MESSAGE, 0x86, 0, 4];
        let mid = message(MID_MESSAGE, 0x86, [10, 0, 0, 9], &[172, 16, 0, 1]);

        let buf = packet(&[broken, mid]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();

        assert_eq!(outcome.parse_errors, 1);
        assert_eq!(outcome.messages.len(), 1);
        match &outcome.messages[0].body {
            MessageBody::Mid { aliases } => assert_eq!(aliases, &[v4(172, 16, 0, 1)]),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn size_past_packet_end_stops_the_walk() {
        // Declares 32 bytes but only the header made it into the packet.
        let broken = vec![HELLO_MESSAGE, 0x86, 0, 32];
        let buf = packet(&[broken]);

        let outcome = parse_packet(&buf, AddressFamily::Ipv4).unwrap();
        assert_eq!(outcome.parse_errors, 1);
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn truncated_packet_header_is_an_error() {
        assert!(parse_packet(&[0, 16], AddressFamily::Ipv4).is_err());
    }

    #[test]
    fn ipv6_originator_width_is_respected() {
        let mut msg = Vec::new();
        msg.push(MID_MESSAGE);
        msg.push(0x86);
        msg.extend_from_slice(&40u16.to_be_bytes()); // 4 + 16 + 4 + one alias
        let originator = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9);
        msg.extend_from_slice(&originator.octets());
        msg.push(64);
        msg.push(0);
        msg.extend_from_slice(&1u16.to_be_bytes());
        let alias = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 10);
        msg.extend_from_slice(&alias.octets());

        let buf = packet(&[msg]);
        let outcome = parse_packet(&buf, AddressFamily::Ipv6).unwrap();
        assert_eq!(outcome.messages[0].originator, IpAddr::V6(originator));
        match &outcome.messages[0].body {
            MessageBody::Mid { aliases } => assert_eq!(aliases, &[IpAddr::V6(alias)]),
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
