//! TLS record parser.
//!
//! Only enough of TLS is parsed to extract session-establishment evidence:
//! record headers, ClientHello/ServerHello with the Server Name and ALPN
//! extensions, and the chosen cipher suite. `parse` returns `None` for
//! anything that is not a TLS record (callers use this to tell "not TLS"
//! from "malformed TLS"); a boundary violation inside a record is reported
//! through the `truncated` flag, never as an error.

use crate::bytes::{Reader, Truncated};

pub const CONTENT_CIPHER_CHANGE: u8 = 0x14;
pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APP_DATA: u8 = 0x17;

const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;
const HANDSHAKE_CLIENT_KEY_EXCHANGE: u8 = 0x10;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// One TLS record header plus the decoded handshake body, when present.
#[derive(Debug, Clone)]
pub struct TlsRecord {
    pub content_type: u8,
    /// Record-layer version (major << 8 | minor).
    pub version: u16,
    pub length: u16,
    pub truncated: bool,
    pub handshake: Option<Handshake>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    ClientHello,
    ServerHello,
    ClientKeyExchange,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub kind: HandshakeKind,
    pub hello: Option<Hello>,
}

/// Fields shared by ClientHello and ServerHello.
#[derive(Debug, Clone, Default)]
pub struct Hello {
    /// Inner hello version, which may differ from the record version.
    pub version: u16,
    /// Chosen cipher suite (ServerHello only).
    pub cipher_suite: Option<u16>,
    pub server_name: Option<String>,
    pub alpn: Option<String>,
}

impl TlsRecord {
    pub fn has_client_hello(&self) -> bool {
        matches!(
            self.handshake,
            Some(Handshake {
                kind: HandshakeKind::ClientHello,
                ..
            })
        )
    }

    pub fn has_server_hello(&self) -> bool {
        matches!(
            self.handshake,
            Some(Handshake {
                kind: HandshakeKind::ServerHello,
                ..
            })
        )
    }

    pub fn has_client_key_exchange(&self) -> bool {
        matches!(
            self.handshake,
            Some(Handshake {
                kind: HandshakeKind::ClientKeyExchange,
                ..
            })
        )
    }

    pub fn hello(&self) -> Option<&Hello> {
        self.handshake.as_ref().and_then(|h| h.hello.as_ref())
    }

    /// ALPN `tds/8.0` marks the record as SQL Server TDS 8.0 traffic.
    pub fn is_tds8(&self) -> bool {
        self.hello()
            .and_then(|h| h.alpn.as_deref())
            .is_some_and(|alpn| alpn == "tds/8.0")
    }
}

/// Parse one TLS record starting at `offset`.
pub fn parse(payload: &[u8], offset: usize) -> Option<TlsRecord> {
    let mut r = Reader::at(payload, offset);
    let content_type = r.read_u8().ok()?;
    if !(CONTENT_CIPHER_CHANGE..=CONTENT_APP_DATA).contains(&content_type) {
        return None;
    }
    let version = r.read_u16_be().ok()?;
    if !is_valid_version(version) {
        return None;
    }
    let length = r.read_u16_be().ok()?;

    let mut record = TlsRecord {
        content_type,
        version,
        length,
        truncated: false,
        handshake: None,
    };

    if content_type == CONTENT_HANDSHAKE {
        match parse_handshake(&mut r) {
            Some((handshake, truncated)) => {
                record.handshake = Some(handshake);
                record.truncated = truncated;
            }
            None => {
                // too short to hold even a hello header: truncated record;
                // otherwise a handshake type outside our concern
                if r.remaining() < 10 {
                    record.truncated = true;
                } else {
                    return None;
                }
            }
        }
    }
    Some(record)
}

fn parse_handshake(r: &mut Reader<'_>) -> Option<(Handshake, bool)> {
    let kind = match r.peek_u8(0).ok()? {
        HANDSHAKE_CLIENT_HELLO => HandshakeKind::ClientHello,
        HANDSHAKE_SERVER_HELLO => HandshakeKind::ServerHello,
        HANDSHAKE_CLIENT_KEY_EXCHANGE => {
            return Some((
                Handshake {
                    kind: HandshakeKind::ClientKeyExchange,
                    hello: None,
                },
                false,
            ));
        }
        _ => return None,
    };

    r.skip(1).ok()?; // handshake type
    let length_hi = r.read_u8().ok()?;
    if length_hi != 0 {
        // the enclosing record length is 16-bit, so a hello longer than
        // 64 KiB means garbage
        return None;
    }
    r.skip(2).ok()?; // low 16 bits of the handshake length

    let mut hello = Hello {
        version: r.read_u16_be().ok()?,
        ..Hello::default()
    };
    if !is_valid_version(hello.version) {
        return None;
    }

    // a truncated hello still reports what it managed to read
    let truncated = parse_hello_body(r, kind, &mut hello).is_err();
    Some((
        Handshake {
            kind,
            hello: Some(hello),
        },
        truncated,
    ))
}

fn parse_hello_body(
    r: &mut Reader<'_>,
    kind: HandshakeKind,
    hello: &mut Hello,
) -> Result<(), Truncated> {
    r.skip(32)?; // random
    let session_id_len = r.read_u8()? as usize;
    r.skip(session_id_len)?;

    match kind {
        HandshakeKind::ClientHello => {
            let cipher_suites_len = r.read_u16_be()? as usize;
            r.skip(cipher_suites_len)?;
            let compression_len = r.read_u8()? as usize;
            r.skip(compression_len)?;
        }
        HandshakeKind::ServerHello => {
            hello.cipher_suite = Some(r.read_u16_be()?);
            r.skip(1)?; // compression method
        }
        HandshakeKind::ClientKeyExchange => return Ok(()),
    }

    // pre-extension hellos end here
    if r.remaining() < 2 {
        return Ok(());
    }
    let extensions_len = r.read_u16_be()? as usize;
    let extensions_end = r.pos() + extensions_len;
    while r.pos() < extensions_end {
        let ext_type = r.read_u16_be()?;
        let ext_len = r.read_u16_be()? as usize;
        match ext_type {
            EXT_SERVER_NAME => {
                let list_start = r.pos();
                let list_len = r.read_u16_be()? as usize;
                while r.pos() < list_start + 2 + list_len {
                    let name_type = r.read_u8()?;
                    let name_len = r.read_u16_be()? as usize;
                    if name_type == 0 && hello.server_name.is_none() {
                        hello.server_name = Some(r.read_ansi_string(name_len)?);
                    } else {
                        r.skip(name_len)?;
                    }
                }
            }
            EXT_ALPN => {
                let list_start = r.pos();
                let list_len = r.read_u16_be()? as usize;
                while r.pos() < list_start + 2 + list_len {
                    let name_len = r.read_u8()? as usize;
                    if hello.alpn.is_none() {
                        hello.alpn = Some(r.read_ansi_string(name_len)?);
                    } else {
                        r.skip(name_len)?;
                    }
                }
            }
            _ => r.skip(ext_len)?,
        }
    }
    Ok(())
}

/// Record and hello version fields this parser accepts.
pub fn is_valid_version(version: u16) -> bool {
    let major = (version >> 8) as u8;
    let minor = (version & 0xFF) as u8;
    matches!((major, minor), (0, 2) | (2, 0) | (3, 0..=4))
}

/// Friendly protocol name for a version field.
pub fn version_name(version: u16) -> String {
    let major = version >> 8;
    let minor = version & 0xFF;
    match (major, minor) {
        (0, 2) | (2, 0) => "SSL 2.0".to_string(),
        (3, 0) => "SSL 3.0".to_string(),
        (3, 1) => "TLS 1.0".to_string(),
        (3, 2) => "TLS 1.1".to_string(),
        (3, 3) => "TLS 1.2".to_string(),
        (3, 4) => "TLS 1.3".to_string(),
        _ => format!("SSL {major}.{minor}"),
    }
}

/// Anything below TLS 1.2 is reported as a weak protocol version.
pub fn is_low_version(version: u16) -> bool {
    version < 0x0303
}

/// Ephemeral Diffie-Hellman (non-EC) cipher suites, flagged because their
/// key exchange defeats passive decryption aids used in support cases.
pub fn is_dhe_cipher_suite(code: u16) -> bool {
    matches!(
        code,
        0x0011..=0x0016
            | 0x0032
            | 0x0033
            | 0x0038
            | 0x0039
            | 0x0040
            | 0x0044
            | 0x0045
            | 0x0067
            | 0x006A
            | 0x006B
            | 0x0087
            | 0x0088
            | 0x008E..=0x0091
            | 0x009E
            | 0x009F
            | 0x00A2
            | 0x00A3
            | 0x00AA
            | 0x00AB
            | 0x00B2..=0x00B5
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a handshake record with a ClientHello or ServerHello body.
    pub(crate) fn hello_record(
        kind: u8,
        version: u16,
        cipher_suite: u16,
        server_name: Option<&str>,
        alpn: Option<&str>,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length
        if kind == HANDSHAKE_CLIENT_HELLO {
            body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
            body.extend_from_slice(&cipher_suite.to_be_bytes());
            body.push(1); // one compression method
            body.push(0);
        } else {
            body.extend_from_slice(&cipher_suite.to_be_bytes());
            body.push(0); // compression method
        }

        let mut exts = Vec::new();
        if let Some(name) = server_name {
            let mut list = Vec::new();
            list.push(0u8); // host name
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name.as_bytes());
            exts.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
            exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
            exts.extend_from_slice(&list);
        }
        if let Some(proto) = alpn {
            let mut list = Vec::new();
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
            exts.extend_from_slice(&EXT_ALPN.to_be_bytes());
            exts.extend_from_slice(&((list.len() + 2) as u16).to_be_bytes());
            exts.extend_from_slice(&(list.len() as u16).to_be_bytes());
            exts.extend_from_slice(&list);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![kind, 0];
        hs.extend_from_slice(&(body.len() as u16).to_be_bytes());
        hs.extend_from_slice(&body);

        let mut record = vec![CONTENT_HANDSHAKE];
        record.extend_from_slice(&version.to_be_bytes());
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    pub(crate) fn client_hello_record(server_name: Option<&str>, alpn: Option<&str>) -> Vec<u8> {
        hello_record(HANDSHAKE_CLIENT_HELLO, 0x0303, 0x009E, server_name, alpn)
    }

    pub(crate) fn server_hello_record(cipher_suite: u16, alpn: Option<&str>) -> Vec<u8> {
        hello_record(HANDSHAKE_SERVER_HELLO, 0x0303, cipher_suite, None, alpn)
    }

    pub(crate) fn key_exchange_record() -> Vec<u8> {
        vec![CONTENT_HANDSHAKE, 0x03, 0x03, 0x00, 0x02, 0x10, 0x00]
    }

    #[test]
    fn cipher_change_and_app_data_records_parse() {
        let ccs = [CONTENT_CIPHER_CHANGE, 0x03, 0x03, 0x00, 0x01, 0x01];
        let parsed = parse(&ccs, 0).expect("record");
        assert_eq!(parsed.content_type, CONTENT_CIPHER_CHANGE);
        assert!(parsed.handshake.is_none());

        let app = [CONTENT_APP_DATA, 0x03, 0x03, 0x00, 0x10, 0xEE];
        let parsed = parse(&app, 0).expect("record");
        assert_eq!(parsed.content_type, CONTENT_APP_DATA);
        assert_eq!(parsed.length, 16);
    }

    #[test]
    fn client_hello_sni_and_alpn_decode() {
        let rec = client_hello_record(Some("sql01.contoso.com"), Some("tds/8.0"));
        let parsed = parse(&rec, 0).expect("tls record");
        assert!(parsed.has_client_hello());
        assert!(parsed.is_tds8());
        let hello = parsed.hello().expect("hello");
        assert_eq!(hello.server_name.as_deref(), Some("sql01.contoso.com"));
        assert_eq!(hello.version, 0x0303);
        assert!(!parsed.truncated);
    }

    #[test]
    fn server_hello_records_cipher_suite() {
        let rec = server_hello_record(0x009E, None);
        let parsed = parse(&rec, 0).expect("tls record");
        assert!(parsed.has_server_hello());
        let hello = parsed.hello().expect("hello");
        assert_eq!(hello.cipher_suite, Some(0x009E));
        assert!(is_dhe_cipher_suite(0x009E));
        assert!(!is_dhe_cipher_suite(0xC02F));
    }

    #[test]
    fn invalid_version_is_not_tls() {
        let mut rec = client_hello_record(None, None);
        rec[1] = 0x07; // bogus record version
        assert!(parse(&rec, 0).is_none());
    }

    #[test]
    fn unknown_content_type_is_not_tls() {
        assert!(parse(&[0x42, 0x03, 0x03, 0, 0], 0).is_none());
    }

    #[test]
    fn truncated_hello_is_flagged_not_fatal() {
        let rec = client_hello_record(Some("sql01"), None);
        let cut = &rec[..20];
        let parsed = parse(cut, 0).expect("record header parses");
        assert!(parsed.truncated);
    }

    #[test]
    fn key_exchange_detected() {
        let parsed = parse(&key_exchange_record(), 0).expect("record");
        assert!(parsed.has_client_key_exchange());
    }

    #[test]
    fn version_names() {
        assert_eq!(version_name(0x0303), "TLS 1.2");
        assert_eq!(version_name(0x0301), "TLS 1.0");
        assert!(is_low_version(0x0302));
        assert!(!is_low_version(0x0304));
    }
}
