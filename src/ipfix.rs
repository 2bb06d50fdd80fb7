use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};

pub const IPFIX_VERSION: u16 = 10;

const MESSAGE_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Sctp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub id: u16,
    pub length: u16,
    pub enterprise: Option<u32>,
}

impl FieldSpec {
    pub const fn iana(id: u16, length: u16) -> Self {
        Self {
            id,
            length,
            enterprise: None,
        }
    }

    pub const fn vendor(id: u16, length: u16, enterprise: u32) -> Self {
        Self {
            id,
            length,
            enterprise: Some(enterprise),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<FieldSpec>,
}

impl Template {
    pub fn new(id: u16, fields: Vec<FieldSpec>) -> Self {
        Self { id, fields }
    }

    /// Fixed on-wire length of one data record of this template.
    pub fn record_len(&self) -> usize {
        self.fields.iter().map(|f| f.length as usize).sum()
    }
}

enum CollectorSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

struct Collector {
    addr: SocketAddr,
    socket: CollectorSocket,
}

struct OpenSet {
    template_id: u16,
    start: usize,
}

/// IPFIX exporting process: frames template and data sets into version 10
/// messages and pushes them to the registered collectors. Sends are
/// best-effort; a failing collector is logged and skipped (RFC 7011 framing,
/// no retry queue).
pub struct Exporter {
    observation_domain_id: u32,
    sequence_number: u32,
    collectors: Vec<Collector>,
    templates: HashMap<u16, Template>,
    sets: Vec<u8>,
    open_set: Option<OpenSet>,
    pending_records: u32,
}

impl Exporter {
    pub fn new(observation_domain_id: u32) -> Self {
        Self {
            observation_domain_id,
            sequence_number: 0,
            collectors: Vec::new(),
            templates: HashMap::new(),
            sets: Vec::new(),
            open_set: None,
            pending_records: 0,
        }
    }

    pub fn add_collector(
        &mut self,
        ip: IpAddr,
        port: u16,
        transport: Transport,
        _mtu_hint: u16,
    ) -> anyhow::Result<()> {
        let addr = SocketAddr::new(ip, port);
        let socket = match transport {
            Transport::Udp => {
                let bind_addr: SocketAddr = if ip.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let socket = UdpSocket::bind(bind_addr)
                    .and_then(|s| s.connect(addr).map(|_| s))
                    .with_context(|| format!("failed to open UDP collector {}", addr))?;
                CollectorSocket::Udp(socket)
            }
            Transport::Tcp => {
                let stream = TcpStream::connect(addr)
                    .with_context(|| format!("failed to connect TCP collector {}", addr))?;
                CollectorSocket::Tcp(stream)
            }
            Transport::Sctp => {
                anyhow::bail!("SCTP collector {} is not supported", addr);
            }
        };

        tracing::info!("added collector {}", addr);
        self.collectors.push(Collector { addr, socket });
        Ok(())
    }

    pub fn init_compression(&mut self, method: &str, _params: &str) -> anyhow::Result<()> {
        if method.is_empty() {
            return Ok(());
        }
        anyhow::bail!("compression method {:?} is not supported", method)
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    /// Registers a template and announces it to all collectors in its own
    /// message.
    pub fn declare_template(&mut self, template: Template) -> anyhow::Result<()> {
        anyhow::ensure!(
            template.id >= 256,
            "template id {} collides with the reserved set id range",
            template.id
        );

        let set = template_set_bytes(&template);
        self.templates.insert(template.id, template);

        let message = frame_message(
            self.observation_domain_id,
            self.sequence_number,
            chrono::Utc::now().timestamp() as u32,
            &set,
        );
        self.transmit(&message);
        Ok(())
    }

    pub fn start_data_set(&mut self, template_id: u16) -> anyhow::Result<()> {
        anyhow::ensure!(self.open_set.is_none(), "data set already open");
        anyhow::ensure!(
            self.templates.contains_key(&template_id),
            "data set references undeclared template {}",
            template_id
        );

        let start = self.sets.len();
        self.sets.extend_from_slice(&template_id.to_be_bytes());
        self.sets.extend_from_slice(&[0, 0]); // length, patched on end
        self.open_set = Some(OpenSet { template_id, start });
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.open_set.is_some(), "field appended outside a data set");
        self.sets.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn put_addr(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(addr) => self.put_bytes(&addr.octets()),
            IpAddr::V6(addr) => self.put_bytes(&addr.octets()),
        }
    }

    pub fn end_data_set(&mut self) -> anyhow::Result<()> {
        let open = self
            .open_set
            .take()
            .ok_or_else(|| anyhow::anyhow!("no data set open"))?;

        let set_len = self.sets.len() - open.start;
        let payload = set_len - SET_HEADER_LEN;
        let record_len = self.templates[&open.template_id].record_len();
        anyhow::ensure!(
            record_len > 0 && payload % record_len == 0,
            "data set for template {} is not record aligned ({} bytes)",
            open.template_id,
            payload
        );

        self.sets[open.start + 2..open.start + 4]
            .copy_from_slice(&(set_len as u16).to_be_bytes());
        self.pending_records += (payload / record_len) as u32;
        Ok(())
    }

    /// Frames and transmits everything accumulated since the last send. A
    /// message without sets is not sent.
    pub fn send_message(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.open_set.is_none(), "data set still open");
        if self.sets.is_empty() {
            return Ok(());
        }

        let message = frame_message(
            self.observation_domain_id,
            self.sequence_number,
            chrono::Utc::now().timestamp() as u32,
            &self.sets,
        );
        self.transmit(&message);

        self.sequence_number = self.sequence_number.wrapping_add(self.pending_records);
        self.pending_records = 0;
        self.sets.clear();
        Ok(())
    }

    /// Drops a half-built message, e.g. after a failed record.
    pub fn abort_message(&mut self) {
        self.open_set = None;
        self.pending_records = 0;
        self.sets.clear();
    }

    fn transmit(&mut self, message: &[u8]) {
        for collector in &mut self.collectors {
            let result = match &mut collector.socket {
                CollectorSocket::Udp(socket) => socket.send(message).map(|_| ()),
                CollectorSocket::Tcp(stream) => stream.write_all(message),
            };
            if let Err(err) = result {
                tracing::error!("failed to send IPFIX message to {}: {}", collector.addr, err);
            }
        }
    }
}

fn frame_message(odid: u32, sequence: u32, export_time: u32, sets: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(MESSAGE_HEADER_LEN + sets.len());
    message.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
    message.extend_from_slice(&((MESSAGE_HEADER_LEN + sets.len()) as u16).to_be_bytes());
    message.extend_from_slice(&export_time.to_be_bytes());
    message.extend_from_slice(&sequence.to_be_bytes());
    message.extend_from_slice(&odid.to_be_bytes());
    message.extend_from_slice(sets);
    message
}

fn template_set_bytes(template: &Template) -> Vec<u8> {
    let mut set = Vec::new();
    set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
    set.extend_from_slice(&[0, 0]); // length, patched below
    set.extend_from_slice(&template.id.to_be_bytes());
    set.extend_from_slice(&(template.fields.len() as u16).to_be_bytes());

    for field in &template.fields {
        match field.enterprise {
            Some(enterprise) => {
                set.extend_from_slice(&(field.id | 0x8000).to_be_bytes());
                set.extend_from_slice(&field.length.to_be_bytes());
                set.extend_from_slice(&enterprise.to_be_bytes());
            }
            None => {
                set.extend_from_slice(&field.id.to_be_bytes());
                set.extend_from_slice(&field.length.to_be_bytes());
            }
        }
    }

    let len = set.len() as u16;
    set[2..4].copy_from_slice(&len.to_be_bytes());
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn flow_template() -> Template {
        Template::new(
            256,
            vec![
                FieldSpec::iana(8, 4),  // sourceIPv4Address
                FieldSpec::iana(12, 4), // destinationIPv4Address
                FieldSpec::iana(1, 8),  // octetDeltaCount
            ],
        )
    }

    #[test]
    fn template_set_encodes_enterprise_bit() {
        let template = Template::new(
            300,
            vec![FieldSpec::iana(8, 4), FieldSpec::vendor(3, 2, 9999)],
        );
        let set = template_set_bytes(&template);

        assert_eq!(&set[0..2], &2u16.to_be_bytes()); // template set id
        assert_eq!(&set[2..4], &(set.len() as u16).to_be_bytes());
        assert_eq!(&set[4..6], &300u16.to_be_bytes());
        assert_eq!(&set[6..8], &2u16.to_be_bytes()); // field count
        assert_eq!(&set[8..10], &8u16.to_be_bytes());
        assert_eq!(&set[10..12], &4u16.to_be_bytes());
        assert_eq!(&set[12..14], &(3u16 | 0x8000).to_be_bytes());
        assert_eq!(&set[14..16], &2u16.to_be_bytes());
        assert_eq!(&set[16..20], &9999u32.to_be_bytes());
    }

    #[test]
    fn data_set_is_length_patched_and_record_counted() {
        let mut exporter = Exporter::new(1);
        exporter.declare_template(flow_template()).unwrap();

        exporter.start_data_set(256).unwrap();
        for _ in 0..2 {
            exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
            exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
            exporter.put_u64(1234);
        }
        exporter.end_data_set().unwrap();

        assert_eq!(exporter.pending_records, 2);
        assert_eq!(&exporter.sets[0..2], &256u16.to_be_bytes());
        let set_len = u16::from_be_bytes([exporter.sets[2], exporter.sets[3]]);
        assert_eq!(set_len as usize, exporter.sets.len());
    }

    #[test]
    fn misaligned_data_set_is_rejected() {
        let mut exporter = Exporter::new(1);
        exporter.declare_template(flow_template()).unwrap();

        exporter.start_data_set(256).unwrap();
        exporter.put_u8(0xff);
        assert!(exporter.end_data_set().is_err());
    }

    #[test]
    fn undeclared_template_cannot_open_a_set() {
        let mut exporter = Exporter::new(1);
        assert!(exporter.start_data_set(256).is_err());
    }

    #[test]
    fn message_framing_and_sequence_over_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut exporter = Exporter::new(7);
        exporter
            .add_collector(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                Transport::Udp,
                1500,
            )
            .unwrap();
        exporter.declare_template(flow_template()).unwrap();

        let mut buf = [0u8; 1500];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[0..2], &10u16.to_be_bytes());
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]) as usize, len);
        assert_eq!(&buf[12..16], &7u32.to_be_bytes()); // observation domain

        exporter.start_data_set(256).unwrap();
        exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        exporter.put_u64(99);
        exporter.end_data_set().unwrap();
        exporter.send_message().unwrap();

        let len = receiver.recv(&mut buf).unwrap();
        // header + set header + one 16 byte record
        assert_eq!(len, 16 + 4 + 16);
        assert_eq!(&buf[8..12], &0u32.to_be_bytes()); // first data message
        assert_eq!(&buf[16..18], &256u16.to_be_bytes());
        assert_eq!(&buf[28..36], &99u64.to_be_bytes());

        // The sequence number advances by exported data records.
        exporter.start_data_set(256).unwrap();
        exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        exporter.put_addr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        exporter.put_u64(100);
        exporter.end_data_set().unwrap();
        exporter.send_message().unwrap();

        receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
    }

    #[test]
    fn sctp_collector_is_rejected() {
        let mut exporter = Exporter::new(1);
        let result = exporter.add_collector(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            4739,
            Transport::Sctp,
            1500,
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_message_is_not_sent() {
        let mut exporter = Exporter::new(1);
        assert!(exporter.send_message().is_ok());
        assert_eq!(exporter.sequence_number, 0);
    }
}
