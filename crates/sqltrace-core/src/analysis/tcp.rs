//! Whole-trace TCP analysis passes.
//!
//! All four passes run after every file has been decoded, in a fixed order
//! (each depends on the previous), and share the same bounded backward-scan
//! idiom: at most `lookback` prior same-direction frames are examined,
//! stopping early on flag boundaries. The bound trades a missed match in
//! pathological interleavings for linear running time per conversation.

use crate::model::{AnalysisOptions, FrameId, NetworkTrace, TICKS_PER_SECOND};

/// Pass 1: conversations first observed mid-handshake from the wrong side
/// get their roles swapped, so the handshake originator is always "source".
pub(crate) fn normalize_directions(trace: &mut NetworkTrace) {
    for ci in 0..trace.conversations.len() {
        let Some(&first) = trace.conversations[ci].frames.first() else {
            continue;
        };
        let f = &trace.frames[first];
        if f.is_udp {
            continue;
        }
        let backwards = (f.is_bare_syn() && !f.is_from_client)
            || (f.is_syn_ack() && f.is_from_client);
        if backwards {
            trace.reverse_source_dest(ci);
        }
    }
}

/// Pass 2: retransmit detection. A frame repeats earlier data when a prior
/// same-direction frame has the same payload length and a sequence number
/// equal to or covering this frame's. Payloads under 8 bytes are excluded
/// so keep-alive ACKs and similar noise never match. IPv4 frames must also
/// differ in packet identifier, or they are capture duplicates rather than
/// wire retransmits.
pub(crate) fn find_retransmits(trace: &mut NetworkTrace, opts: &AnalysisOptions) {
    for ci in 0..trace.conversations.len() {
        let ids = trace.conversations[ci].frames.clone();
        for i in 0..ids.len() {
            let fid = ids[i];
            let (payload_len, seq_no, from_client, ident) = {
                let f = &trace.frames[fid];
                (f.payload_len(), f.seq_no, f.is_from_client, f.ipv4_ident)
            };
            if payload_len < 8 {
                continue;
            }

            let mut back = 0usize;
            let mut original: Option<FrameId> = None;
            for &pid in ids[..i].iter().rev() {
                let prior = &trace.frames[pid];
                if prior.is_from_client != from_client {
                    continue;
                }
                back += 1;
                let prior_len = prior.payload_len();
                let diff = seq_no.wrapping_sub(prior.seq_no) as usize;
                if payload_len == prior_len && diff < prior_len {
                    if ident.is_some() && ident == prior.ipv4_ident {
                        break; // same IPv4 ident: capture duplicate, not a retransmit
                    }
                    // chase to the canonical original so every retransmit
                    // of the same data points at one frame
                    original = Some(prior.retransmit_of.unwrap_or(pid));
                    break;
                }
                if back >= opts.lookback {
                    break;
                }
            }

            if let Some(orig) = original {
                let f = &mut trace.frames[fid];
                f.is_retransmit = true;
                f.retransmit_of = Some(orig);
                trace.frames[orig].retransmit_count += 1;
                let c = &mut trace.conversations[ci];
                c.raw_retransmits += 1;
                if payload_len > 1 {
                    c.sig_retransmits += 1;
                }
            }
        }
    }
}

/// Pass 3: keep-alive retransmits. Keep-alives repeat on a 1 s timer, so
/// consecutive same-direction keep-alives within 1.1x that interval are
/// chained to the first of the run.
pub(crate) fn find_keep_alive_retransmits(trace: &mut NetworkTrace, opts: &AnalysisOptions) {
    let max_gap = TICKS_PER_SECOND + TICKS_PER_SECOND / 10;
    for ci in 0..trace.conversations.len() {
        let ids = trace.conversations[ci].frames.clone();
        for i in 0..ids.len() {
            let fid = ids[i];
            let (is_keep_alive, from_client, ticks) = {
                let f = &trace.frames[fid];
                (f.is_keep_alive, f.is_from_client, f.ticks)
            };
            if !is_keep_alive {
                continue;
            }

            let mut back = 0usize;
            let mut first: Option<FrameId> = None;
            for &pid in ids[..i].iter().rev() {
                let prior = &trace.frames[pid];
                if prior.is_from_client != from_client {
                    continue;
                }
                back += 1;
                if prior.is_keep_alive {
                    if ticks.saturating_sub(prior.ticks) <= max_gap {
                        first = Some(prior.keep_alive_of.unwrap_or(pid));
                    }
                    break;
                }
                if back >= opts.lookback {
                    break;
                }
            }

            if let Some(first) = first {
                let f = &mut trace.frames[fid];
                f.is_keep_alive_retransmit = true;
                f.keep_alive_of = Some(first);
                trace.conversations[ci].keep_alive_retransmits += 1;
            }
        }
    }
}

/// Pass 4: continuation frames. A payload-bearing frame acknowledging the
/// same data as an earlier un-pushed send from the same side is the tail of
/// a still-accumulating application message; downstream classification
/// defers on such frames.
pub(crate) fn find_continuations(trace: &mut NetworkTrace, opts: &AnalysisOptions) {
    for ci in 0..trace.conversations.len() {
        let ids = trace.conversations[ci].frames.clone();
        for i in 0..ids.len() {
            let fid = ids[i];
            let (payload_len, ack_no, from_client) = {
                let f = &trace.frames[fid];
                (f.payload_len(), f.ack_no, f.is_from_client)
            };
            if payload_len == 0 {
                continue;
            }

            let mut back = 0usize;
            let mut continuation = false;
            for &pid in ids[..i].iter().rev() {
                let prior = &trace.frames[pid];
                if prior.is_from_client != from_client {
                    continue;
                }
                back += 1;
                if prior.has_push() {
                    break; // a push ends the prior message
                }
                if prior.ack_no == ack_no && !prior.is_retransmit && prior.payload_len() > 0 {
                    continuation = true;
                    break;
                }
                if back >= opts.lookback {
                    break;
                }
            }

            if continuation {
                trace.frames[fid].is_continuation = true;
            }
        }
    }
}
