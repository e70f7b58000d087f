//! PreLogin option-table walk.
//!
//! The PreLogin payload after the TDS header is a table of
//! (option u8, offset u16 BE, length u16 BE) entries terminated by 0xFF,
//! with option values stored at header-relative offsets. The client and
//! server walks differ: the client announces, the server decides.

use crate::bytes::{Reader, u8_at, u16_be_at, u32_le_at};
use crate::model::Conversation;

use super::tokens::HEADER_LEN;

const OPTION_VERSION: u8 = 0;
const OPTION_ENCRYPTION: u8 = 1;
const OPTION_INSTANCE: u8 = 2;
const OPTION_THREAD_ID: u8 = 3;
const OPTION_MARS: u8 = 4;
const OPTION_TERMINATOR: u8 = 0xFF;

/// Client PreLogin: version, encryption request, thread id, MARS request.
pub fn apply_client_prelogin(payload: &[u8], conv: &mut Conversation) {
    let mut i = HEADER_LEN;
    loop {
        let Ok(option) = u8_at(payload, i) else {
            return;
        };
        if option == OPTION_TERMINATOR {
            return;
        }
        let (Ok(offset), Ok(length)) = (u16_be_at(payload, i + 1), u16_be_at(payload, i + 3))
        else {
            return;
        };
        let at = HEADER_LEN + offset as usize;
        if at >= payload.len() {
            return;
        }
        match option {
            OPTION_VERSION => {
                if let Some(version) = read_version(payload, at) {
                    conv.client_version = Some(version);
                }
            }
            OPTION_ENCRYPTION => {
                if u8_at(payload, at) == Ok(1) {
                    conv.is_encrypted = true;
                }
            }
            OPTION_INSTANCE => {
                // requested instance name, present but unused downstream
                let _ = length;
            }
            OPTION_THREAD_ID => {
                if length == 4 {
                    if let Ok(tid) = u32_le_at(payload, at) {
                        conv.thread_id = tid;
                    }
                }
            }
            OPTION_MARS => {
                if u8_at(payload, at) == Ok(1) {
                    conv.is_mars_enabled = true;
                }
            }
            _ => {}
        }
        i += 5;
    }
}

/// Server PreLogin response: the server's encryption and MARS decisions are
/// final. Option offsets below 26 are rejected: a TDS continuation fragment
/// can look like a PreLogin and fake the walk out.
pub fn apply_server_prelogin(payload: &[u8], conv: &mut Conversation) {
    let mut i = HEADER_LEN;
    loop {
        let Ok(option) = u8_at(payload, i) else {
            return;
        };
        if option == OPTION_TERMINATOR {
            return;
        }
        let Ok(offset) = u16_be_at(payload, i + 1) else {
            return;
        };
        let at = HEADER_LEN + offset as usize;
        if at >= payload.len() || offset < 26 {
            return;
        }
        match option {
            OPTION_ENCRYPTION => {
                if let Ok(encrypt) = u8_at(payload, at) {
                    conv.is_encrypted = encrypt == 1 || encrypt == 3;
                    conv.is_enc_required = encrypt == 3;
                }
            }
            OPTION_MARS => {
                if let Ok(mars) = u8_at(payload, at) {
                    conv.is_mars_enabled = mars == 1;
                }
            }
            _ => {}
        }
        i += 5;
    }
}

fn read_version(payload: &[u8], at: usize) -> Option<String> {
    let mut r = Reader::at(payload, at);
    let major = r.read_u16_le().ok()?;
    let minor = r.read_u16_be().ok()?;
    let level = r.read_u16_be().ok()?;
    Some(format!("{major}.{minor}.{level}"))
}
