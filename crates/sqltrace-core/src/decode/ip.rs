//! IPv4 and IPv6 decoders, including the ESP trailer probe and AH skip.
//!
//! The IP layer also resolves the owning conversation: TCP and UDP port
//! numbers sit at the same offsets, so the ports are peeked here and the
//! frame is attached before the transport decoder runs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{Decoder, NextProtocol};
use crate::bytes::{Truncated, u8_at, u16_be_at, u32_be_at};
use crate::diag::DiagKind;
use crate::model::Frame;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_IPV6_IN_IPV4: u8 = 41;
const PROTO_ESP: u8 = 50;
const PROTO_AH: u8 = 51;

impl Decoder<'_> {
    pub(super) fn ipv4(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut header_length = ((u8_at(data, offset)? & 0x0F) as usize) * 4;
        let total_length = u16_be_at(data, offset + 2)? as usize;
        let ident = u16_be_at(data, offset + 4)?;
        let mut next = u8_at(data, offset + 9)?;
        let src = IpAddr::V4(Ipv4Addr::from(u32_be_at(data, offset + 12)?));
        let dst = IpAddr::V4(Ipv4Addr::from(u32_be_at(data, offset + 16)?));

        // end of the IP payload; Ethernet padding may extend past this
        self.last_byte_end = if total_length == 0 {
            data.len()
        } else {
            (offset + total_length).min(data.len())
        };
        frame.ipv4_ident = Some(ident);

        if next == PROTO_IPV6_IN_IPV4 {
            // tunneled IPv6: take its next-header and step over the fixed
            // header, ignoring extension headers
            next = u8_at(data, offset + header_length + 6)?;
            header_length += 40;
        }

        let mut transport_offset = offset + header_length;
        self.strip_ipsec(data, &mut transport_offset, &mut next, frame)?;

        match next {
            PROTO_TCP | PROTO_UDP => {
                self.transport(data, transport_offset, next, src, dst, frame)
            }
            other => self.dispatch(data, transport_offset, NextProtocol::Ip(other), frame),
        }
    }

    pub(super) fn ipv6(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let payload_length = u16_be_at(data, offset + 4)? as usize;
        let mut next = u8_at(data, offset + 6)?;
        let src_hi = crate::bytes::Reader::at(data, offset + 8).read_u64_be()?;
        let src_lo = crate::bytes::Reader::at(data, offset + 16).read_u64_be()?;
        let dst_hi = crate::bytes::Reader::at(data, offset + 24).read_u64_be()?;
        let dst_lo = crate::bytes::Reader::at(data, offset + 32).read_u64_be()?;
        let src = IpAddr::V6(Ipv6Addr::from(((src_hi as u128) << 64) | src_lo as u128));
        let dst = IpAddr::V6(Ipv6Addr::from(((dst_hi as u128) << 64) | dst_lo as u128));
        let header_length = 40usize;

        self.last_byte_end = if payload_length == 0 {
            data.len()
        } else {
            (offset + header_length + payload_length).min(data.len())
        };

        let mut transport_offset = offset + header_length;
        self.strip_ipsec(data, &mut transport_offset, &mut next, frame)?;

        match next {
            PROTO_TCP | PROTO_UDP => {
                self.transport(data, transport_offset, next, src, dst, frame)
            }
            0 | 43 | 44 | 60 | 135 => {
                self.diag.record_at(
                    DiagKind::UnknownProtocol,
                    format!("IPv6 extension header {next} not decoded"),
                    Some(self.file_name.to_string()),
                    Some(frame.frame_no),
                );
                Ok(())
            }
            other => self.dispatch(data, transport_offset, NextProtocol::Ip(other), frame),
        }
    }

    /// ESP and AH handling shared by both IP versions. ESP rewrites the
    /// payload bounds and the next protocol from its trailer; AH is a plain
    /// skip.
    fn strip_ipsec(
        &mut self,
        data: &[u8],
        transport_offset: &mut usize,
        next: &mut u8,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        if *next == PROTO_ESP {
            match esp_trailer_length(data, self.last_byte_end) {
                Ok((trailer, inner)) => {
                    self.last_byte_end -= trailer;
                    *transport_offset += 8; // SPI + sequence
                    *next = inner;
                }
                Err(_) => {
                    self.diag.record_at(
                        DiagKind::UnknownProtocol,
                        "unrecognized ESP trailer, frame ignored".to_string(),
                        Some(self.file_name.to_string()),
                        Some(frame.frame_no),
                    );
                    *next = 0;
                }
            }
        }
        if *next == PROTO_AH {
            let ah = *transport_offset;
            *next = u8_at(data, ah)?;
            let ah_len = (u8_at(data, ah + 1)? as usize) * 4 + 8;
            *transport_offset += ah_len;
        }
        Ok(())
    }
}

/// ESP carries no explicit trailer length: the integrity blob is either 12
/// or 16 bytes. Try both, validating the 1,2,3,… padding pattern, and
/// return (total trailer length, inner protocol).
fn esp_trailer_length(data: &[u8], payload_end: usize) -> Result<(usize, u8), Truncated> {
    for icv_len in [12usize, 16] {
        if payload_end < icv_len + 2 {
            continue;
        }
        let proto_at = payload_end - 1 - icv_len;
        let next = u8_at(data, proto_at)?;
        let pad_len = u8_at(data, proto_at - 1)? as usize;
        if esp_padding_ok(data, proto_at - 2, pad_len) {
            return Ok((icv_len + 2 + pad_len, next));
        }
    }
    Err(Truncated {
        needed: payload_end,
        have: data.len(),
    })
}

fn esp_padding_ok(data: &[u8], last_pad: usize, pad_len: usize) -> bool {
    for i in 0..pad_len {
        let Some(pos) = last_pad.checked_sub(i) else {
            return false;
        };
        match data.get(pos) {
            Some(&b) if b as usize == pad_len - i => {}
            _ => return false,
        }
    }
    true
}
