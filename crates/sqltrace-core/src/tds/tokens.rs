//! TDS packet-type and token constants, plus the token-stream walks used to
//! pull login evidence out of server RESPONSE packets.
//!
//! Tokens are self-describing: type byte, little-endian length, payload.
//! Walks skip token to token by each token's own length field and stop at a
//! DONE token or the end of the captured buffer; any out-of-range read ends
//! the walk as "not found" rather than erroring.

use crate::bytes::{Reader, u8_at, u16_le_at, u32_le_at};

/// TDS packet-type codes (first payload byte).
pub mod packet_type {
    pub const SQLBATCH: u8 = 1;
    pub const LOGIN: u8 = 2;
    pub const RPC: u8 = 3;
    pub const RESPONSE: u8 = 4;
    pub const ATTENTION: u8 = 6;
    pub const BULKLOAD: u8 = 7;
    pub const DTC: u8 = 14;
    pub const LOGIN7: u8 = 16;
    pub const SSPI: u8 = 17;
    pub const PRELOGIN: u8 = 18;
    /// TDS 8.0 cipher change record at the top level.
    pub const TDS8_CCS: u8 = 0x14;
    /// TDS 8.0 TLS record at the top level.
    pub const TDS8_TLS: u8 = 0x16;
    /// TLS application data (the encrypted login payload).
    pub const APP_DATA: u8 = 0x17;

    pub fn is_known(value: u8) -> bool {
        matches!(
            value,
            SQLBATCH
                | LOGIN
                | RPC
                | RESPONSE
                | ATTENTION
                | BULKLOAD
                | DTC
                | LOGIN7
                | SSPI
                | PRELOGIN
                | TDS8_CCS
                | TDS8_TLS
                | APP_DATA
        )
    }
}

/// Token codes inside a RESPONSE packet.
pub mod token {
    pub const PRELOGIN_RESPONSE: u8 = 0;
    pub const ERROR: u8 = 170;
    pub const INFO: u8 = 171;
    pub const LOGINACK: u8 = 173;
    pub const ENVCHANGE: u8 = 227;
    pub const SSPI: u8 = 237;
    pub const DONE: u8 = 253;
}

/// TDS header length preceding the token stream.
pub const HEADER_LEN: usize = 8;

const NTLM_SIGNATURE: &[u8] = b"NTLMSSP\0";
const NTLM_CHALLENGE: u8 = 2;
const NTLM_AUTHENTICATE: u8 = 3;

/// Offset of the first `wanted` token at or after `start`, walking the
/// self-describing token stream.
pub fn token_offset(payload: &[u8], wanted: u8, start: usize) -> Option<usize> {
    let mut offset = start;
    while offset + 2 < payload.len() {
        let t = payload[offset];
        if t == wanted {
            return Some(offset);
        }
        if t == token::DONE {
            return None;
        }
        let token_length = u16_le_at(payload, offset + 1).ok()? as usize;
        offset += token_length + 3;
    }
    None
}

/// ERROR token fields extracted from a login-time server response.
#[derive(Debug, Clone)]
pub struct ErrorToken {
    pub number: u32,
    pub state: u8,
    pub message: String,
}

pub fn parse_error_token(payload: &[u8]) -> Option<ErrorToken> {
    let number = u32_le_at(payload, HEADER_LEN + 3).ok()?;
    let state = u8_at(payload, HEADER_LEN + 7).ok()?;
    let message_chars = u16_le_at(payload, HEADER_LEN + 9).ok()? as usize;
    let mut r = Reader::at(payload, HEADER_LEN + 11);
    let message = r.read_unicode_string(message_chars).ok()?;
    Some(ErrorToken {
        number,
        state,
        message,
    })
}

/// LOGINACK token: negotiated server TDS version and program version.
#[derive(Debug, Clone)]
pub struct LoginAckToken {
    pub tds_version: u32,
    pub server_version: String,
}

pub fn parse_login_ack(payload: &[u8], offset: usize) -> Option<LoginAckToken> {
    // token(1) length(2) interface(1) tds-version(4 BE) progname-len(1)
    // progname(len*2) major(1) minor(1) build-hi(1) build-lo(1)
    let tds_version = crate::bytes::u32_be_at(payload, offset + 4).ok()?;
    let name_len = u8_at(payload, offset + 8).ok()? as usize * 2;
    let v = offset + name_len + 9;
    let server_version = format!(
        "{}.{}.{}.{}",
        u8_at(payload, v).ok()?,
        u8_at(payload, v + 1).ok()?,
        u8_at(payload, v + 2).ok()?,
        u8_at(payload, v + 3).ok()?,
    );
    Some(LoginAckToken {
        tds_version,
        server_version,
    })
}

/// Server name carried in the INFO token after the message text.
pub fn parse_info_server_name(payload: &[u8], offset: usize) -> Option<String> {
    let message_chars = u16_le_at(payload, offset + 9).ok()? as usize;
    let after_message = offset + message_chars * 2;
    let name_chars = u8_at(payload, after_message + 11).ok()? as usize;
    let mut r = Reader::at(payload, after_message + 12);
    r.read_unicode_string(name_chars).ok()
}

/// ENVCHANGE observations from one RESPONSE packet.
#[derive(Debug, Clone, Default)]
pub struct EnvChanges {
    pub database: Option<String>,
    pub redirect_server: Option<String>,
    pub redirect_port: u16,
}

/// Walk every ENVCHANGE token in the stream, collecting the database-name
/// and routing sub-types.
pub fn parse_env_changes(payload: &[u8]) -> EnvChanges {
    let mut env = EnvChanges::default();
    let mut offset = token_offset(payload, token::ENVCHANGE, HEADER_LEN);
    while let Some(at) = offset {
        let Ok(token_length) = u16_le_at(payload, at + 1) else {
            break;
        };
        match u8_at(payload, at + 3) {
            Ok(1) => {
                // new active database
                if let Ok(name_chars) = u8_at(payload, at + 4) {
                    let mut r = Reader::at(payload, at + 5);
                    if let Ok(name) = r.read_unicode_string(name_chars as usize) {
                        env.database = Some(name);
                    }
                }
            }
            Ok(0x14) => {
                // server redirection target
                if let (Ok(port), Ok(server_chars)) =
                    (u16_le_at(payload, at + 7), u8_at(payload, at + 9))
                {
                    let mut r = Reader::at(payload, at + 11);
                    if let Ok(server) = r.read_unicode_string(server_chars as usize) {
                        env.redirect_port = port;
                        env.redirect_server = Some(server);
                    }
                }
            }
            _ => {}
        }
        offset = token_offset(payload, token::ENVCHANGE, at + token_length as usize + 3);
    }
    env
}

/// SSPI request packet carrying an NTLM Authenticate message.
pub fn is_ntlm_response(payload: &[u8]) -> bool {
    payload.len() > 16
        && payload[HEADER_LEN..].starts_with(NTLM_SIGNATURE)
        && payload[16] == NTLM_AUTHENTICATE
}

/// RESPONSE packet carrying an SSPI token with an NTLM Challenge message.
pub fn is_ntlm_challenge(payload: &[u8]) -> bool {
    payload.len() > 19
        && payload[HEADER_LEN] == token::SSPI
        && payload[11..].starts_with(NTLM_SIGNATURE)
        && payload[19] == NTLM_CHALLENGE
}

/// Null-credential check on an NTLM Authenticate message: both the domain
/// and user name length fields are zero.
pub fn has_null_ntlm_credentials(payload: &[u8]) -> bool {
    let mut r = Reader::at(payload, HEADER_LEN);
    let parsed = (|| -> Result<(u16, u16), crate::bytes::Truncated> {
        r.skip(8)?; // NTLMSSP signature
        r.skip(4)?; // message type
        r.skip(8)?; // LmChallengeResponseFields
        r.skip(8)?; // NtChallengeResponseFields
        let domain_len = r.read_u16_le()?;
        r.skip(2)?; // domain maximum length
        r.skip(4)?; // domain buffer offset
        let user_len = r.read_u16_le()?;
        Ok((domain_len, user_len))
    })();
    match parsed {
        Ok((domain_len, user_len)) => domain_len == 0 && user_len == 0,
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// TDS header for a synthetic packet.
    pub(crate) fn tds_header(packet_type: u8, total_len: u16) -> Vec<u8> {
        vec![
            packet_type,
            0x01, // EOM
            (total_len >> 8) as u8,
            (total_len & 0xFF) as u8,
            0,
            0, // SPID
            1, // packet id
            0, // window
        ]
    }

    fn push_token(buf: &mut Vec<u8>, token: u8, body: &[u8]) {
        buf.push(token);
        buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
        buf.extend_from_slice(body);
    }

    fn unicode(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    /// A successful login RESPONSE: ENVCHANGE(database) + INFO + LOGINACK.
    pub(crate) fn login_ack_response(database: &str, server_name: &str, version: u32) -> Vec<u8> {
        let mut body = Vec::new();

        let mut env = vec![1u8]; // sub-type: database
        env.push(database.encode_utf16().count() as u8);
        env.extend_from_slice(&unicode(database));
        env.push(0); // old value length
        push_token(&mut body, token::ENVCHANGE, &env);

        let msg = "Changed database context";
        let mut info = Vec::new();
        info.extend_from_slice(&5701u32.to_le_bytes());
        info.push(2); // state
        info.push(0); // class
        info.extend_from_slice(&(msg.encode_utf16().count() as u16).to_le_bytes());
        info.extend_from_slice(&unicode(msg));
        info.push(server_name.encode_utf16().count() as u8);
        info.extend_from_slice(&unicode(server_name));
        info.push(0); // proc name length
        info.extend_from_slice(&0u32.to_le_bytes()); // line number
        push_token(&mut body, token::INFO, &info);

        let prog = "Microsoft SQL Server";
        let mut ack = vec![1u8]; // interface
        ack.extend_from_slice(&version.to_be_bytes());
        ack.push(prog.encode_utf16().count() as u8);
        ack.extend_from_slice(&unicode(prog));
        ack.extend_from_slice(&[16, 0, 4, 0]); // program version
        push_token(&mut body, token::LOGINACK, &ack);

        push_token(&mut body, token::DONE, &[0, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut packet = tds_header(packet_type::RESPONSE, (body.len() + HEADER_LEN) as u16);
        packet.extend_from_slice(&body);
        packet
    }

    /// A login ERROR response.
    pub(crate) fn error_response(number: u32, state: u8, message: &str) -> Vec<u8> {
        let mut err = Vec::new();
        err.extend_from_slice(&number.to_le_bytes());
        err.push(state);
        err.push(14); // class
        err.extend_from_slice(&(message.encode_utf16().count() as u16).to_le_bytes());
        err.extend_from_slice(&unicode(message));
        err.push(0); // server name length
        err.push(0); // proc name length
        err.extend_from_slice(&0u32.to_le_bytes());
        let mut body = Vec::new();
        push_token(&mut body, token::ERROR, &err);
        let mut packet = tds_header(packet_type::RESPONSE, (body.len() + HEADER_LEN) as u16);
        packet.extend_from_slice(&body);
        packet
    }

    #[test]
    fn token_walk_finds_later_tokens_and_stops_at_done() {
        let packet = login_ack_response("master", "SQL01", 0x74000004);
        assert!(token_offset(&packet, token::ENVCHANGE, HEADER_LEN).is_some());
        assert!(token_offset(&packet, token::INFO, HEADER_LEN).is_some());
        assert!(token_offset(&packet, token::LOGINACK, HEADER_LEN).is_some());
        // DONE terminates the walk before any token after it could match
        assert!(token_offset(&packet, 0x42, HEADER_LEN).is_none());
    }

    #[test]
    fn login_ack_and_env_change_extraction() {
        let packet = login_ack_response("master", "SQL01", 0x74000004);
        let at = token_offset(&packet, token::LOGINACK, HEADER_LEN).unwrap();
        let ack = parse_login_ack(&packet, at).unwrap();
        assert_eq!(ack.tds_version, 0x74000004);
        assert_eq!(ack.server_version, "16.0.4.0");

        let env = parse_env_changes(&packet);
        assert_eq!(env.database.as_deref(), Some("master"));

        let info_at = token_offset(&packet, token::INFO, HEADER_LEN).unwrap();
        assert_eq!(
            parse_info_server_name(&packet, info_at).as_deref(),
            Some("SQL01")
        );
    }

    #[test]
    fn error_token_extraction() {
        let packet = error_response(18456, 1, "Login failed for user 'sa'.");
        let err = parse_error_token(&packet).unwrap();
        assert_eq!(err.number, 18456);
        assert_eq!(err.state, 1);
        assert!(err.message.contains("Login failed"));
    }

    #[test]
    fn token_walk_tolerates_truncation() {
        let packet = login_ack_response("master", "SQL01", 0x74000004);
        let cut = &packet[..12];
        assert!(token_offset(cut, token::LOGINACK, HEADER_LEN).is_none());
    }

    #[test]
    fn ntlm_null_credentials_requires_both_lengths_zero() {
        let mut packet = tds_header(packet_type::SSPI, 0);
        packet.extend_from_slice(NTLM_SIGNATURE);
        packet.extend_from_slice(&3u32.to_le_bytes()); // Authenticate
        packet.extend_from_slice(&[0u8; 16]); // LM + NT response fields
        packet.extend_from_slice(&[0u8; 8]); // null domain fields
        packet.extend_from_slice(&[0u8; 8]); // null user fields
        assert!(is_ntlm_response(&packet));
        assert!(has_null_ntlm_credentials(&packet));

        // a non-zero user length clears the flag
        let user_len_at = HEADER_LEN + 8 + 4 + 16 + 8;
        packet[user_len_at] = 4;
        assert!(!has_null_ntlm_credentials(&packet));
    }
}
