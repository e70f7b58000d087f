//! Protocol decoder chain.
//!
//! Encapsulations nest in a DAG, not a fixed stack (GRE can carry Ethernet
//! via ERSPAN, VLAN can precede either IP version), so decoding is a single
//! dispatcher parameterized by a next-protocol tag rather than nested
//! type-specific call sites. Each decoder reads its header, determines the
//! next tag, and recurses; TCP/UDP resolve the owning conversation and
//! attach the frame.
//!
//! Every read is bounds-checked. A truncated read aborts only the current
//! frame: the error is converted to a per-conversation counter at the frame
//! boundary and the next frame decodes normally.

mod ip;
mod link;
mod transport;
mod tunnel;

use std::net::IpAddr;

use crate::bytes::Truncated;
use crate::diag::{DiagKind, Diagnostics};
use crate::model::{AnalysisOptions, ConvId, Frame, FrameId, NetworkTrace};
use crate::source::RawFrame;

/// Tag selecting the next decoder in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextProtocol {
    /// Capture link-layer type.
    Link(u16),
    /// EtherType from an Ethernet/VLAN/VNTag/SNAP header.
    Ether(u16),
    /// IP protocol number.
    Ip(u8),
    /// GRE protocol field.
    Gre(u16),
    /// PPP protocol field (GRE version 1 payloads).
    Ppp(u16),
}

pub(crate) struct Decoder<'a> {
    pub trace: &'a mut NetworkTrace,
    pub diag: &'a mut Diagnostics,
    pub opts: &'a AnalysisOptions,
    pub file_name: &'a str,
    /// Conversation resolved for the frame, if the chain reached transport.
    pub conv: Option<ConvId>,
    /// Set when the frame was identified as a capture-artifact duplicate.
    pub duplicate: bool,
    pub source_mac: u64,
    pub dest_mac: u64,
    /// Exclusive end of the IP payload within the frame buffer; Ethernet
    /// padding may extend beyond this.
    pub last_byte_end: usize,
    /// Sequence flag from the GRE header, used to tell ERSPAN I from II.
    pub gre_had_sequence: bool,
}

impl Decoder<'_> {
    pub fn dispatch(
        &mut self,
        data: &[u8],
        offset: usize,
        next: NextProtocol,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        match next {
            NextProtocol::Link(0) | NextProtocol::Link(1) => self.ethernet(data, offset, frame),
            NextProtocol::Link(6) => self.wifi(data, offset, frame),
            NextProtocol::Link(0x0071) | NextProtocol::Link(0xE071) => {
                self.linux_cooked(data, offset, frame)
            }
            NextProtocol::Link(101) => self.raw_ip(data, offset, frame),
            NextProtocol::Link(other) => {
                self.note_unknown(format!("link type {other} (0x{other:04X})"), frame);
                Ok(())
            }
            NextProtocol::Ether(0x0800) => self.ipv4(data, offset, frame),
            NextProtocol::Ether(0x86DD) => self.ipv6(data, offset, frame),
            NextProtocol::Ether(0x8100) => self.vlan(data, offset, frame),
            NextProtocol::Ether(0x8926) => self.vntag(data, offset, frame),
            NextProtocol::Ether(0x0806) | NextProtocol::Ether(0x88CC) => Ok(()), // ARP, LLDP
            NextProtocol::Ether(other) => {
                self.note_unknown(format!("EtherType 0x{other:04X}"), frame);
                Ok(())
            }
            NextProtocol::Ip(47) => self.gre(data, offset, frame),
            NextProtocol::Ip(proto) => {
                // ESP/AH and TCP/UDP are consumed inside the IP decoders
                // because they need the addressing context; anything that
                // reaches here is outside our concern.
                match proto {
                    1 | 2 | 58 => {} // ICMP, IGMP, ICMPv6
                    other => {
                        self.note_unknown(format!("IP protocol {other}"), frame);
                    }
                }
                Ok(())
            }
            NextProtocol::Gre(proto) => self.gre_payload(data, offset, proto, frame),
            NextProtocol::Ppp(0x0021) => self.ipv4(data, offset, frame),
            NextProtocol::Ppp(0x0057) => self.ipv6(data, offset, frame),
            NextProtocol::Ppp(other) => {
                self.note_unknown(format!("PPP protocol 0x{other:04X}"), frame);
                Ok(())
            }
        }
    }

    fn note_unknown(&mut self, what: String, frame: &Frame) {
        self.diag.record_at(
            DiagKind::UnknownProtocol,
            format!("{what} ignored"),
            Some(self.file_name.to_string()),
            Some(frame.frame_no),
        );
    }

    /// Direction of a frame relative to the conversation's nominal source.
    pub(crate) fn from_client(&self, cid: ConvId, src_ip: IpAddr, src_port: u16) -> bool {
        let c = &self.trace.conversations[cid];
        c.source_ip == src_ip && c.source_port == src_port
    }
}

/// Decode one captured frame into the trace.
///
/// Returns the appended frame id, or `None` when the frame carried no
/// TCP/UDP payload for us (unknown protocol, capture duplicate, or a
/// truncation before the transport layer).
pub fn decode_frame(
    trace: &mut NetworkTrace,
    diag: &mut Diagnostics,
    opts: &AnalysisOptions,
    file_ix: usize,
    raw: &RawFrame,
) -> Option<FrameId> {
    let file_name = trace.files[file_ix].path.clone();
    let mut frame = Frame::new(raw.frame_no, file_ix, raw.ticks);
    frame.frame_length = raw.frame_length;
    frame.captured_length = raw.captured_length;

    let (outcome, conv, duplicate, source_mac, dest_mac) = {
        let mut d = Decoder {
            trace: &mut *trace,
            diag: &mut *diag,
            opts,
            file_name: &file_name,
            conv: None,
            duplicate: false,
            source_mac: 0,
            dest_mac: 0,
            last_byte_end: raw.data.len(),
            gre_had_sequence: false,
        };
        let outcome = d.dispatch(&raw.data, 0, NextProtocol::Link(raw.link_type), &mut frame);
        (outcome, d.conv, d.duplicate, d.source_mac, d.dest_mac)
    };

    if let Err(trunc) = outcome {
        if let Some(cid) = conv {
            trace.conversations[cid].truncation_error_count += 1;
        }
        diag.record_at(
            DiagKind::Truncation,
            trunc.to_string(),
            Some(file_name),
            Some(raw.frame_no),
        );
        return None;
    }
    if duplicate {
        return None;
    }
    let cid = conv?;
    let fid = trace.append_frame(frame, cid);
    transport::apply_conversation_stats(trace, cid, fid, raw, source_mac, dest_mac);
    Some(fid)
}
