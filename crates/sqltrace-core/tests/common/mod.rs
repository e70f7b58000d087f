//! Builders for synthetic captures driven through the public pipeline.
#![allow(dead_code)]

use sqltrace_core::{CaptureSource, RawFrame, SourceError};

/// In-memory frame source.
pub struct VecSource {
    frames: std::vec::IntoIter<RawFrame>,
}

impl VecSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl CaptureSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        Ok(self.frames.next())
    }
}

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];
pub const CLIENT_PORT: u16 = 50123;
pub const SERVER_PORT: u16 = 1433;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RESET: u8 = 0x04;
    pub const PUSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// Builds one TCP conversation's frames with monotonically increasing
/// sequence numbers and IPv4 identifiers per side.
pub struct ConvBuilder {
    frames: Vec<RawFrame>,
    frame_no: u32,
    client_seq: u32,
    server_seq: u32,
    client_ident: u16,
    server_ident: u16,
}

impl ConvBuilder {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            frame_no: 0,
            client_seq: 1_000,
            server_seq: 9_000,
            client_ident: 0x1000,
            server_ident: 0x8000,
        }
    }

    pub fn finish(self) -> Vec<RawFrame>  {
        self.frames
    }

    pub fn syn(&mut self, ticks: u64) -> &mut Self {
        self.push(true, flags::SYN, &[], ticks);
        self
    }

    pub fn syn_ack(&mut self, ticks: u64) -> &mut Self {
        self.push(false, flags::SYN | flags::ACK, &[], ticks);
        self
    }

    pub fn ack(&mut self, ticks: u64, from_client: bool) -> &mut Self {
        self.push(from_client, flags::ACK, &[], ticks);
        self
    }

    pub fn fin(&mut self, ticks: u64, from_client: bool) -> &mut Self {
        self.push(from_client, flags::FIN | flags::ACK, &[], ticks);
        self
    }

    pub fn reset(&mut self, ticks: u64, from_client: bool) -> &mut Self {
        self.push(from_client, flags::RESET, &[], ticks);
        self
    }

    pub fn keep_alive(&mut self, ticks: u64, from_client: bool) -> &mut Self {
        // keep-alives repeat the last sequence number with one byte
        let seq = if from_client {
            &mut self.client_seq
        } else {
            &mut self.server_seq
        };
        *seq = seq.wrapping_sub(1);
        self.push(from_client, flags::ACK, &[0], ticks);
        self
    }

    pub fn payload(&mut self, ticks: u64, from_client: bool, payload: &[u8]) -> &mut Self {
        self.push(from_client, flags::ACK | flags::PUSH, payload, ticks);
        self
    }

    fn push(&mut self, from_client: bool, tcp_flags: u8, payload: &[u8], ticks: u64) {
        let (src, sport, dst, dport) = if from_client {
            (CLIENT, CLIENT_PORT, SERVER, SERVER_PORT)
        } else {
            (SERVER, SERVER_PORT, CLIENT, CLIENT_PORT)
        };
        let (seq, ack, ident) = if from_client {
            self.client_ident += 1;
            (self.client_seq, self.server_seq, self.client_ident)
        } else {
            self.server_ident += 1;
            (self.server_seq, self.client_seq, self.server_ident)
        };

        let data = tcp_frame(src, sport, dst, dport, tcp_flags, seq, ack, ident, payload);
        if from_client {
            self.client_seq = self.client_seq.wrapping_add(payload.len().max(
                usize::from(tcp_flags & flags::SYN != 0),
            ) as u32);
        } else {
            self.server_seq = self.server_seq.wrapping_add(payload.len().max(
                usize::from(tcp_flags & flags::SYN != 0),
            ) as u32);
        }

        self.frame_no += 1;
        self.frames.push(RawFrame {
            frame_no: self.frame_no,
            ticks,
            frame_length: data.len() as u32,
            captured_length: data.len() as u32,
            link_type: 1,
            data,
        });
    }
}

/// Ethernet + IPv4 + TCP frame bytes.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    tcp_flags: u8,
    seq: u32,
    ack: u32,
    ident: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    b.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    b.extend_from_slice(&[0x08, 0x00]);
    let total = (40 + payload.len()) as u16;
    b.extend_from_slice(&[0x45, 0]);
    b.extend_from_slice(&total.to_be_bytes());
    b.extend_from_slice(&ident.to_be_bytes());
    b.extend_from_slice(&[0, 0, 64, 6, 0, 0]);
    b.extend_from_slice(&src);
    b.extend_from_slice(&dst);
    b.extend_from_slice(&sport.to_be_bytes());
    b.extend_from_slice(&dport.to_be_bytes());
    b.extend_from_slice(&seq.to_be_bytes());
    b.extend_from_slice(&ack.to_be_bytes());
    b.push(0x50);
    b.push(tcp_flags);
    b.extend_from_slice(&0x2000u16.to_be_bytes());
    b.extend_from_slice(&[0, 0, 0, 0]);
    b.extend_from_slice(payload);
    b
}

// --- TDS payload builders ---------------------------------------------------

pub fn tds_header(packet_type: u8, total_len: u16) -> Vec<u8> {
    vec![
        packet_type,
        0x01,
        (total_len >> 8) as u8,
        (total_len & 0xFF) as u8,
        0,
        0,
        1,
        0,
    ]
}

fn unicode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn push_token(buf: &mut Vec<u8>, token: u8, body: &[u8]) {
    buf.push(token);
    buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
    buf.extend_from_slice(body);
}

/// Client PreLogin packet with the given encryption option value.
pub fn prelogin(encrypt: u8) -> Vec<u8> {
    let options: &[(u8, Vec<u8>)] = &[
        (0, vec![16, 0, 0, 0, 0, 0]),                   // version
        (1, vec![encrypt]),                             // encryption
        (3, 0x0042u32.to_le_bytes().to_vec()),          // thread id
        (4, vec![0]),                                   // MARS off
    ];
    let table_len = options.len() * 5 + 1;
    let mut table = Vec::new();
    let mut values = Vec::new();
    for (option, value) in options {
        let offset = (table_len + values.len()) as u16;
        table.push(*option);
        table.extend_from_slice(&offset.to_be_bytes());
        table.extend_from_slice(&(value.len() as u16).to_be_bytes());
        values.extend_from_slice(value);
    }
    table.push(0xFF);
    let mut packet = tds_header(0x12, (8 + table.len() + values.len()) as u16);
    packet.extend_from_slice(&table);
    packet.extend_from_slice(&values);
    packet
}

/// Server PreLogin response (token 0 inside a RESPONSE packet), with option
/// offsets padded past the continuation guard.
pub fn prelogin_response(encrypt: u8) -> Vec<u8> {
    let options = [
        (0u8, vec![16u8, 0, 0, 0, 0, 0]),
        (1, vec![encrypt]),
        (4, vec![0]),
    ];
    let base_table = options.len() * 5 + 1;
    let pad = 26usize.saturating_sub(base_table);
    let table_len = base_table + pad;
    let mut table = Vec::new();
    let mut values = Vec::new();
    for (option, value) in &options {
        let offset = (table_len + values.len()) as u16;
        table.push(*option);
        table.extend_from_slice(&offset.to_be_bytes());
        table.extend_from_slice(&(value.len() as u16).to_be_bytes());
        values.extend_from_slice(value);
    }
    table.push(0xFF);
    table.extend(std::iter::repeat_n(0u8, pad));
    let mut packet = tds_header(0x04, (8 + table.len() + values.len()) as u16);
    packet.extend_from_slice(&table);
    packet.extend_from_slice(&values);
    packet
}

/// Unencrypted LOGIN7 packet (opaque body).
pub fn login7() -> Vec<u8> {
    let body = vec![0u8; 48];
    let mut packet = tds_header(0x10, (8 + body.len()) as u16);
    packet.extend_from_slice(&body);
    packet
}

/// Successful login RESPONSE: ENVCHANGE(database) + INFO + LOGINACK.
pub fn login_ack_response(database: &str, server_name: &str, version: u32) -> Vec<u8> {
    let mut body = Vec::new();

    let mut env = vec![1u8];
    env.push(database.encode_utf16().count() as u8);
    env.extend_from_slice(&unicode(database));
    env.push(0);
    push_token(&mut body, 227, &env);

    let msg = "Changed database context";
    let mut info = Vec::new();
    info.extend_from_slice(&5701u32.to_le_bytes());
    info.push(2);
    info.push(0);
    info.extend_from_slice(&(msg.encode_utf16().count() as u16).to_le_bytes());
    info.extend_from_slice(&unicode(msg));
    info.push(server_name.encode_utf16().count() as u8);
    info.extend_from_slice(&unicode(server_name));
    info.push(0);
    info.extend_from_slice(&0u32.to_le_bytes());
    push_token(&mut body, 171, &info);

    let prog = "Microsoft SQL Server";
    let mut ack = vec![1u8];
    ack.extend_from_slice(&version.to_be_bytes());
    ack.push(prog.encode_utf16().count() as u8);
    ack.extend_from_slice(&unicode(prog));
    ack.extend_from_slice(&[16, 0, 4, 0]);
    push_token(&mut body, 173, &ack);

    push_token(&mut body, 253, &[0, 0, 0, 0, 0, 0, 0, 0, 0]);

    let mut packet = tds_header(0x04, (8 + body.len()) as u16);
    packet.extend_from_slice(&body);
    packet
}

/// Login ERROR response.
pub fn error_response(number: u32, state: u8, message: &str) -> Vec<u8> {
    let mut err = Vec::new();
    err.extend_from_slice(&number.to_le_bytes());
    err.push(state);
    err.push(14);
    err.extend_from_slice(&(message.encode_utf16().count() as u16).to_le_bytes());
    err.extend_from_slice(&unicode(message));
    err.push(0);
    err.push(0);
    err.extend_from_slice(&0u32.to_le_bytes());
    let mut body = Vec::new();
    push_token(&mut body, 170, &err);
    let mut packet = tds_header(0x04, (8 + body.len()) as u16);
    packet.extend_from_slice(&body);
    packet
}

// --- TLS record builders ----------------------------------------------------

fn hello_record(kind: u8, cipher_suite: u16, alpn: Option<&str>) -> Vec<u8> {
    let version = 0x0303u16;
    let mut body = Vec::new();
    body.extend_from_slice(&version.to_be_bytes());
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    if kind == 0x01 {
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&cipher_suite.to_be_bytes());
        body.push(1);
        body.push(0);
    } else {
        body.extend_from_slice(&cipher_suite.to_be_bytes());
        body.push(0);
    }
    let mut exts = Vec::new();
    if let Some(proto) = alpn {
        let mut list = Vec::new();
        list.push(proto.len() as u8);
        list.extend_from_slice(proto.as_bytes());
        exts.extend_from_slice(&0x0010u16.to_be_bytes());
        exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
        exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
        exts.extend_from_slice(&list);
    }
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut hs = vec![kind, 0];
    hs.extend_from_slice(&(body.len() as u16).to_be_bytes());
    hs.extend_from_slice(&body);

    let mut record = vec![0x16];
    record.extend_from_slice(&version.to_be_bytes());
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}

/// TLS ClientHello wrapped in a PreLogin packet.
pub fn tls_client_hello() -> Vec<u8> {
    let record = hello_record(0x01, 0x009C, None);
    let mut packet = tds_header(0x12, (8 + record.len()) as u16);
    packet.extend_from_slice(&record);
    packet
}

/// TLS ServerHello wrapped in a RESPONSE packet.
pub fn tls_server_hello() -> Vec<u8> {
    let record = hello_record(0x02, 0x009C, None);
    let mut packet = tds_header(0x04, (8 + record.len()) as u16);
    packet.extend_from_slice(&record);
    packet
}

/// TLS ClientKeyExchange wrapped in a PreLogin packet.
pub fn tls_key_exchange() -> Vec<u8> {
    let record = vec![0x16, 0x03, 0x03, 0x00, 0x02, 0x10, 0x00];
    let mut packet = tds_header(0x12, (8 + record.len()) as u16);
    packet.extend_from_slice(&record);
    packet
}

/// Cipher-exchange marker wrapped in a PreLogin packet.
pub fn tls_cipher_exchange() -> Vec<u8> {
    let record = vec![0x14, 0x03, 0x03, 0x00, 0x01, 0x01];
    let mut packet = tds_header(0x12, (8 + record.len()) as u16);
    packet.extend_from_slice(&record);
    packet
}

/// Encrypted application data at the top level (no TDS header).
pub fn app_data(len: u16) -> Vec<u8> {
    let mut record = vec![0x17, 0x03, 0x03];
    record.extend_from_slice(&len.to_be_bytes());
    record.extend(std::iter::repeat_n(0xEE, len as usize));
    record
}
