//! GRE and ERSPAN tunnel decoders.
//!
//! GRE version 0 carries IP directly or Ethernet via ERSPAN; version 1 is
//! the PPTP variant carrying PPP. ERSPAN type I has no header of its own,
//! type II has an 8-byte header, type III a 12-byte header with an optional
//! platform sub-header.

use super::{Decoder, NextProtocol};
use crate::bytes::{Reader, Truncated, u8_at};
use crate::model::Frame;

const GRE_FLAG_CHECKSUM: u16 = 0x8000;
const GRE_FLAG_ROUTING: u16 = 0x4000;
const GRE_FLAG_KEY: u16 = 0x2000;
const GRE_FLAG_SEQUENCE: u16 = 0x1000;
const GRE_FLAG_ACK: u16 = 0x0080; // version 1 only

impl Decoder<'_> {
    pub(super) fn gre(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut r = Reader::at(data, offset);
        let flags = r.read_u16_be()?;
        let protocol = r.read_u16_be()?;
        let version = flags & 0x0007;

        match version {
            0 => {
                if flags & (GRE_FLAG_CHECKSUM | GRE_FLAG_ROUTING) != 0 {
                    r.skip(4)?; // checksum + offset
                }
                if flags & GRE_FLAG_KEY != 0 {
                    r.skip(4)?;
                }
                if flags & GRE_FLAG_SEQUENCE != 0 {
                    self.gre_had_sequence = true;
                    r.skip(4)?;
                }
                if flags & GRE_FLAG_ROUTING != 0 {
                    // source route entries: walk until the null SRE
                    loop {
                        let family = r.read_u16_be()?;
                        r.skip(1)?; // SRE offset
                        let length = r.read_u8()? as usize;
                        if family == 0 && length == 0 {
                            break;
                        }
                        r.skip(length)?;
                    }
                }
                self.dispatch(data, r.pos(), NextProtocol::Gre(protocol), frame)
            }
            1 => {
                // PPTP enhanced GRE: key is always present as payload
                // length + call id.
                if protocol != 0x880B {
                    self.note_unknown(
                        format!("GRE v1 protocol 0x{protocol:04X}"),
                        frame,
                    );
                    return Ok(());
                }
                r.skip(4)?; // payload length + call id
                if flags & GRE_FLAG_SEQUENCE != 0 {
                    r.skip(4)?;
                }
                if flags & GRE_FLAG_ACK != 0 {
                    r.skip(4)?;
                }
                self.ppp(data, r.pos(), frame)
            }
            other => {
                self.note_unknown(format!("GRE version {other}"), frame);
                Ok(())
            }
        }
    }

    pub(super) fn gre_payload(
        &mut self,
        data: &[u8],
        offset: usize,
        protocol: u16,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        match protocol {
            0x0800 => self.ipv4(data, offset, frame),
            0x86DD => self.ipv6(data, offset, frame),
            0x6558 => self.ethernet(data, offset, frame), // transparent bridging
            0x88BE => {
                // ERSPAN type II when the GRE header carried a sequence
                // number, type I (headerless) otherwise.
                let inner = if self.gre_had_sequence {
                    offset + 8
                } else {
                    offset
                };
                self.ethernet(data, inner, frame)
            }
            0x22EB => {
                // ERSPAN type III: 12-byte header, optional 8-byte platform
                // sub-header signalled by the O bit (last bit of word 3).
                let opt = u8_at(data, offset + 11)? & 0x01;
                let inner = offset + 12 + if opt != 0 { 8 } else { 0 };
                self.ethernet(data, inner, frame)
            }
            other => {
                self.note_unknown(format!("GRE payload protocol 0x{other:04X}"), frame);
                Ok(())
            }
        }
    }

    fn ppp(&mut self, data: &[u8], offset: usize, frame: &mut Frame) -> Result<(), Truncated> {
        let mut pos = offset;
        // optional address/control bytes
        if u8_at(data, pos)? == 0xFF && u8_at(data, pos + 1)? == 0x03 {
            pos += 2;
        }
        // protocol field is one byte when the low bit is set
        let first = u8_at(data, pos)?;
        let protocol = if first & 0x01 != 0 {
            pos += 1;
            first as u16
        } else {
            let p = crate::bytes::u16_be_at(data, pos)?;
            pos += 2;
            p
        };
        self.dispatch(data, pos, NextProtocol::Ppp(protocol), frame)
    }
}

#[cfg(test)]
mod tests {
    use crate::diag::Diagnostics;
    use crate::model::{AnalysisOptions, FileData, NetworkTrace};
    use crate::source::RawFrame;

    // IPv4 header carrying GRE, followed by an ERSPAN II + Ethernet + IPv4 +
    // TCP stack, exercises the recursive dispatch path end to end.
    #[test]
    fn gre_erspan_ii_reaches_inner_tcp() {
        let inner_tcp = crate::decode::transport::tests::tcp_frame_bytes(
            [10, 0, 0, 1],
            50000,
            [10, 0, 0, 2],
            1433,
            crate::model::tcp_flags::SYN,
            &[],
        );

        // outer IPv4 (proto 47) + GRE with sequence + ERSPAN II header
        let mut outer = Vec::new();
        outer.extend_from_slice(&[0u8; 12]); // outer ethernet MACs
        outer.extend_from_slice(&[0x08, 0x00]);
        let gre_len = 4 + 4 + 8; // GRE hdr + seq + ERSPAN II
        let ip_total = (20 + gre_len + inner_tcp.len()) as u16;
        outer.extend_from_slice(&[0x45, 0]);
        outer.extend_from_slice(&ip_total.to_be_bytes());
        outer.extend_from_slice(&[0, 1, 0, 0, 64, 47, 0, 0]); // ident/frag/ttl/proto
        outer.extend_from_slice(&[192, 168, 0, 1]);
        outer.extend_from_slice(&[192, 168, 0, 2]);
        outer.extend_from_slice(&[0x10, 0x00, 0x88, 0xBE]); // GRE: S bit, ERSPAN II
        outer.extend_from_slice(&[0, 0, 0, 1]); // sequence
        outer.extend_from_slice(&[0u8; 8]); // ERSPAN II header
        outer.extend_from_slice(&inner_tcp);

        let mut trace = NetworkTrace::new();
        trace.files.push(FileData::new("t.cap", 0));
        let mut diag = Diagnostics::new();
        let opts = AnalysisOptions::default();
        let raw = RawFrame {
            frame_no: 1,
            ticks: 0,
            frame_length: outer.len() as u32,
            captured_length: outer.len() as u32,
            link_type: 1,
            data: outer,
        };
        let fid = crate::decode::decode_frame(&mut trace, &mut diag, &opts, 0, &raw);
        assert!(fid.is_some());
        let conv = &trace.conversations[0];
        assert_eq!(conv.dest_port, 1433);
        assert_eq!(conv.syn_count, 1);
    }
}
