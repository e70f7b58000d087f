//! TCP and UDP decoders: the point where a frame resolves its owning
//! conversation and is attached to the trace.

use std::net::IpAddr;

use super::Decoder;
use crate::bytes::{Truncated, u8_at, u16_be_at, u16_le_at, u32_be_at, u32_le_at};
use crate::model::{ConvId, EndpointKey, Frame, FrameId, NetworkTrace};
use crate::source::RawFrame;

const PROTO_TCP: u8 = 6;

const SMP_SYN: u8 = 1;
const SMP_ACK: u8 = 2;
const SMP_FIN: u8 = 4;
const SMP_DATA: u8 = 8;

impl Decoder<'_> {
    /// Port numbers sit at the same offsets for TCP and UDP, so the
    /// conversation is resolved here before the per-protocol parse. A bare
    /// SYN may split off a new epoch of a reused port pair; IPv4 frames may
    /// be identified as capture duplicates and dropped.
    pub(super) fn transport(
        &mut self,
        data: &[u8],
        offset: usize,
        proto: u8,
        src: IpAddr,
        dst: IpAddr,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let src_port = u16_be_at(data, offset)?;
        let dst_port = u16_be_at(data, offset + 2)?;
        let key = EndpointKey {
            source_ip: src,
            source_port: src_port,
            dest_ip: dst,
            dest_port: dst_port,
        };
        let mut cid = self.trace.resolve(&key);
        // from here on a truncated read is charged to this conversation
        self.conv = Some(cid);

        if proto == PROTO_TCP {
            frame.flags = u8_at(data, offset + 13)?;
            if frame.is_bare_syn() {
                cid = self
                    .trace
                    .epoch_for_syn(cid, frame.ticks, self.opts.idle_reuse_threshold);
                self.conv = Some(cid);
            }
        }

        frame.is_from_client = self.from_client(cid, src, src_port);

        // Capture-artifact duplicate: the IPv4 identification repeats within
        // the look-back window. Ident zero carries no information (common
        // with the don't-fragment bit) and is never matched.
        if let Some(ident) = frame.ipv4_ident.filter(|&i| i != 0) {
            if self
                .trace
                .is_capture_duplicate(cid, frame.is_from_client, ident, self.opts.lookback)
            {
                self.trace.conversations[cid].duplicate_count += 1;
                self.duplicate = true;
                return Ok(());
            }
        }

        if proto == PROTO_TCP {
            self.parse_tcp(data, offset, cid, frame)
        } else {
            self.parse_udp(data, offset, cid, frame)
        }
    }

    fn parse_tcp(
        &mut self,
        data: &[u8],
        offset: usize,
        cid: ConvId,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let header_length = ((u8_at(data, offset + 12)? >> 4) as usize) * 4;
        frame.seq_no = u32_be_at(data, offset + 4)?;
        frame.ack_no = u32_be_at(data, offset + 8)?;
        frame.flags = u8_at(data, offset + 13)?;
        frame.window_size = u16_be_at(data, offset + 14)?;

        let payload_end = self.last_byte_end.min(data.len());
        let mut payload_start = offset + header_length;
        let mut payload_len = payload_end.saturating_sub(payload_start);

        // SMP multiplex header: 16 bytes, first byte 0x53, with a length
        // field that must agree with the segment. Validated here because
        // the port alone does not prove SQL traffic.
        if payload_len > 15 && data[payload_start] == 0x53 {
            let smp_type = u8_at(data, payload_start + 1)?;
            let smp_session = u16_le_at(data, payload_start + 2)?;
            let smp_length = u32_le_at(data, payload_start + 4)? as usize;
            let bare = matches!(smp_type, SMP_SYN | SMP_ACK | SMP_FIN)
                && payload_len == 16
                && smp_length == 16;
            let data_bearing = smp_type == SMP_DATA && payload_len > 16 && smp_length == payload_len;
            if bare || data_bearing {
                frame.smp_session = Some(smp_session);
                let c = &mut self.trace.conversations[cid];
                if smp_session > c.smp_max_session {
                    c.smp_max_session = smp_session;
                }
                match smp_type {
                    SMP_SYN => c.smp_syn_count += 1,
                    SMP_ACK => c.smp_ack_count += 1,
                    SMP_FIN => {
                        c.smp_fin_count += 1;
                        c.smp_fin_time.get_or_insert(frame.ticks);
                    }
                    _ => c.smp_data_count += 1,
                }
                payload_start += 16;
                payload_len = payload_end.saturating_sub(payload_start);
            }
        }

        if payload_len > 0 {
            frame.payload = data[payload_start..payload_end].to_vec();
        }

        frame.is_keep_alive = frame.has_ack()
            && !frame.has_syn()
            && !frame.has_fin()
            && !frame.has_reset()
            && frame.payload_len() == 1;
        Ok(())
    }

    fn parse_udp(
        &mut self,
        data: &[u8],
        offset: usize,
        cid: ConvId,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        frame.is_udp = true;
        self.trace.conversations[cid].is_udp = true;
        let payload_end = self.last_byte_end.min(data.len());
        let payload_start = offset + 8;
        if payload_end > payload_start {
            frame.payload = data[payload_start..payload_end].to_vec();
        }
        Ok(())
    }
}

/// Conversation bookkeeping applied once a decoded frame is appended:
/// flag counters, close/open timestamps, byte totals, and MAC identity.
pub(super) fn apply_conversation_stats(
    trace: &mut NetworkTrace,
    cid: ConvId,
    fid: FrameId,
    raw: &RawFrame,
    source_mac: u64,
    dest_mac: u64,
) {
    let (ticks, is_udp, is_from_client, is_keep_alive, flags) = {
        let f = &trace.frames[fid];
        (f.ticks, f.is_udp, f.is_from_client, f.is_keep_alive, f.flags)
    };
    let bare_syn = trace.frames[fid].is_bare_syn();
    let syn_ack = trace.frames[fid].is_syn_ack();

    let c = &mut trace.conversations[cid];
    if source_mac != 0 {
        c.source_mac = source_mac;
    }
    if dest_mac != 0 {
        c.dest_mac = dest_mac;
    }
    if c.start_ticks == 0 || ticks < c.start_ticks {
        c.start_ticks = ticks;
    }
    if ticks > c.end_ticks {
        c.end_ticks = ticks;
    }
    if is_from_client {
        c.source_frames += 1;
    } else {
        c.dest_frames += 1;
    }
    c.total_bytes += raw.data.len() as u64;
    if c.truncated_frame_length == 0 && raw.captured_length != raw.frame_length {
        c.truncated_frame_length = raw.captured_length;
    }

    if !is_udp {
        use crate::model::tcp_flags as fl;
        if flags & fl::FIN != 0 {
            c.fin_count += 1;
            c.fin_time.get_or_insert(ticks);
        }
        if flags & fl::SYN != 0 {
            c.syn_count += 1;
            if bare_syn {
                c.syn_time.get_or_insert(ticks);
            } else if syn_ack {
                c.syn_ack_time.get_or_insert(ticks);
            }
        }
        if flags & fl::RESET != 0 {
            c.reset_count += 1;
            c.reset_time.get_or_insert(ticks);
        }
        if flags & fl::PUSH != 0 {
            c.push_count += 1;
        }
        if flags & fl::ACK != 0 {
            c.ack_count += 1;
        }
        if is_keep_alive {
            c.keep_alive_count += 1;
        }
    }
}
