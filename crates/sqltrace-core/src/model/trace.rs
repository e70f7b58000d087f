use std::collections::HashMap;
use std::net::IpAddr;

use super::{Conversation, ConvId, Frame, FrameId, SqlServer};

/// Unordered endpoint pair identifying a transport flow, as seen from one
/// packet's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointKey {
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
}

impl EndpointKey {
    /// Order-independent 16-bit bucket key. XOR keeps both directions of a
    /// flow in the same bucket for one cheap hash probe.
    pub fn bucket(&self) -> u16 {
        self.source_port ^ self.dest_port
    }

    fn matches(&self, c: &Conversation) -> bool {
        (c.source_ip == self.source_ip
            && c.dest_ip == self.dest_ip
            && c.source_port == self.source_port
            && c.dest_port == self.dest_port)
            || (c.dest_ip == self.source_ip
                && c.source_ip == self.dest_ip
                && c.dest_port == self.source_port
                && c.source_port == self.dest_port)
    }
}

/// One input capture file.
#[derive(Debug, Clone)]
pub struct FileData {
    pub path: String,
    pub size: u64,
    pub start_ticks: u64,
    pub end_ticks: u64,
    pub frame_count: u64,
}

impl FileData {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            start_ticks: 0,
            end_ticks: 0,
            frame_count: 0,
        }
    }
}

/// Top-level store for one analysis run: the frame and conversation arenas,
/// the port-XOR conversation index, and the SQL Server roll-ups.
#[derive(Debug, Default)]
pub struct NetworkTrace {
    pub files: Vec<FileData>,
    pub frames: Vec<Frame>,
    pub conversations: Vec<Conversation>,
    pub sql_servers: Vec<SqlServer>,
    index: HashMap<u16, Vec<ConvId>>,
}

impl NetworkTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the conversation for an endpoint pair, creating one when none
    /// exists. The bucket is scanned newest-first so that when a port pair
    /// has been reused, the most recent epoch wins.
    pub fn resolve(&mut self, key: &EndpointKey) -> ConvId {
        let bucket = key.bucket();
        if let Some(candidates) = self.index.get(&bucket) {
            for &cid in candidates.iter().rev() {
                if key.matches(&self.conversations[cid]) {
                    return cid;
                }
            }
        }
        let cid = self.conversations.len();
        self.conversations.push(Conversation::new(
            key.source_ip,
            key.source_port,
            key.dest_ip,
            key.dest_port,
        ));
        self.index.entry(bucket).or_default().push(cid);
        cid
    }

    /// Port-reuse rule: a bare SYN landing on a conversation that already
    /// closed (any FIN, or a RESET followed by more than the idle threshold
    /// of silence) starts a new epoch rather than extending the old one.
    pub fn epoch_for_syn(&mut self, cid: ConvId, ticks: u64, idle_threshold: u64) -> ConvId {
        let reuse = {
            let c = &self.conversations[cid];
            let idle_gap = c
                .frames
                .last()
                .map(|&fid| ticks.saturating_sub(self.frames[fid].ticks))
                .unwrap_or(0);
            c.fin_count > 0 || (c.reset_count > 0 && idle_gap > idle_threshold)
        };
        if !reuse {
            return cid;
        }
        let next = self.conversations[cid].new_epoch();
        let bucket = (next.source_port ^ next.dest_port) as u16;
        let new_cid = self.conversations.len();
        self.conversations.push(next);
        self.index.entry(bucket).or_default().push(new_cid);
        new_cid
    }

    /// Capture-artifact duplicate check (IPv4 only): the same IP
    /// identification value within the bounded look-back of same-direction
    /// frames means the capture recorded this packet twice.
    pub fn is_capture_duplicate(
        &self,
        cid: ConvId,
        is_from_client: bool,
        ipv4_ident: u16,
        lookback: usize,
    ) -> bool {
        let mut back = 0usize;
        for &fid in self.conversations[cid].frames.iter().rev() {
            let prior = &self.frames[fid];
            if prior.is_from_client != is_from_client {
                continue;
            }
            back += 1;
            if prior.ipv4_ident == Some(ipv4_ident) {
                return true;
            }
            if back >= lookback {
                break;
            }
        }
        false
    }

    /// Append a decoded frame to its conversation; returns the frame id.
    pub fn append_frame(&mut self, mut frame: Frame, cid: ConvId) -> FrameId {
        frame.conversation = cid;
        let fid = self.frames.len();
        self.frames.push(frame);
        self.conversations[cid].frames.push(fid);
        fid
    }

    /// Swap source and destination identity on a conversation and flip the
    /// direction tag on every owned frame, preserving the invariant that
    /// source-tagged frames originate at the source endpoint.
    pub fn reverse_source_dest(&mut self, cid: ConvId) {
        let c = &mut self.conversations[cid];
        std::mem::swap(&mut c.source_mac, &mut c.dest_mac);
        std::mem::swap(&mut c.source_ip, &mut c.dest_ip);
        std::mem::swap(&mut c.source_port, &mut c.dest_port);
        std::mem::swap(&mut c.source_frames, &mut c.dest_frames);
        let frame_ids = c.frames.clone();
        for fid in frame_ids {
            let f = &mut self.frames[fid];
            f.is_from_client = !f.is_from_client;
        }
    }

    pub fn find_sql_server(&self, ip: IpAddr, port: u16) -> Option<usize> {
        self.sql_servers
            .iter()
            .position(|s| s.ip == ip && s.port == port)
    }

    /// Server roll-up for an endpoint, created lazily on first sighting.
    pub fn get_sql_server(&mut self, ip: IpAddr, port: u16) -> usize {
        if let Some(ix) = self.find_sql_server(ip, port) {
            return ix;
        }
        self.sql_servers.push(SqlServer::new(ip, port));
        self.sql_servers.len() - 1
    }

    /// Server whose endpoint matches either side of the conversation.
    pub fn find_sql_server_for(&self, cid: ConvId) -> Option<usize> {
        let c = &self.conversations[cid];
        self.sql_servers.iter().position(|s| {
            (s.ip == c.source_ip && s.port == c.source_port)
                || (s.ip == c.dest_ip && s.port == c.dest_port)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Frame, tcp_flags};

    fn key(a: &str, ap: u16, b: &str, bp: u16) -> EndpointKey {
        EndpointKey {
            source_ip: a.parse().unwrap(),
            source_port: ap,
            dest_ip: b.parse().unwrap(),
            dest_port: bp,
        }
    }

    #[test]
    fn resolve_is_direction_agnostic() {
        let mut t = NetworkTrace::new();
        let forward = key("10.0.0.1", 50000, "10.0.0.2", 1433);
        let reverse = key("10.0.0.2", 1433, "10.0.0.1", 50000);
        let a = t.resolve(&forward);
        let b = t.resolve(&reverse);
        assert_eq!(a, b);
        assert_eq!(t.conversations.len(), 1);
    }

    #[test]
    fn resolve_distinguishes_ip_version_and_ports() {
        let mut t = NetworkTrace::new();
        let v4 = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        let v6 = t.resolve(&key("::1", 50000, "::2", 1433));
        assert_ne!(v4, v6);
        // same XOR bucket, different pair
        let other = t.resolve(&key("10.0.0.1", 1433, "10.0.0.2", 50000));
        assert_ne!(v4, other);
    }

    #[test]
    fn epoch_for_syn_splits_after_reset_and_idle_gap() {
        let mut t = NetworkTrace::new();
        let cid = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        let mut f = Frame::new(1, 0, 1_000);
        f.flags = tcp_flags::RESET;
        t.append_frame(f, cid);
        t.conversations[cid].reset_count = 1;

        // gap below the threshold keeps the same conversation
        let same = t.epoch_for_syn(cid, 1_000 + 5 * 10_000_000, 10 * 10_000_000);
        assert_eq!(same, cid);

        // 11 s after the reset, the SYN starts a new epoch
        let split = t.epoch_for_syn(cid, 1_000 + 11 * 10_000_000, 10 * 10_000_000);
        assert_ne!(split, cid);
        assert!(t.conversations[split].frames.is_empty());

        // the new epoch is now the bucket's newest entry and wins resolve
        let resolved = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        assert_eq!(resolved, split);
    }

    #[test]
    fn epoch_for_syn_splits_on_any_fin() {
        let mut t = NetworkTrace::new();
        let cid = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        let mut f = Frame::new(1, 0, 1_000);
        f.flags = tcp_flags::FIN | tcp_flags::ACK;
        t.append_frame(f, cid);
        t.conversations[cid].fin_count = 1;
        let split = t.epoch_for_syn(cid, 1_001, 10 * 10_000_000);
        assert_ne!(split, cid);
    }

    #[test]
    fn capture_duplicates_found_within_lookback_only() {
        let mut t = NetworkTrace::new();
        let cid = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        let mut f = Frame::new(1, 0, 0);
        f.is_from_client = true;
        f.ipv4_ident = Some(0x4242);
        t.append_frame(f, cid);

        assert!(t.is_capture_duplicate(cid, true, 0x4242, 20));
        // other direction does not match
        assert!(!t.is_capture_duplicate(cid, false, 0x4242, 20));

        // push the original past the look-back bound
        for i in 0..20 {
            let mut filler = Frame::new(2 + i, 0, 0);
            filler.is_from_client = true;
            filler.ipv4_ident = Some(i as u16);
            t.append_frame(filler, cid);
        }
        assert!(!t.is_capture_duplicate(cid, true, 0x4242, 20));
    }

    #[test]
    fn reverse_source_dest_flips_every_frame() {
        let mut t = NetworkTrace::new();
        let cid = t.resolve(&key("10.0.0.1", 50000, "10.0.0.2", 1433));
        let mut f = Frame::new(1, 0, 0);
        f.is_from_client = true;
        t.append_frame(f, cid);
        let mut g = Frame::new(2, 0, 0);
        g.is_from_client = false;
        t.append_frame(g, cid);

        t.reverse_source_dest(cid);
        let c = &t.conversations[cid];
        assert_eq!(c.source_port, 1433);
        assert_eq!(c.dest_port, 50000);
        assert!(!t.frames[0].is_from_client);
        assert!(t.frames[1].is_from_client);
    }

    #[test]
    fn sql_server_rollup_is_lazy_and_deduplicated() {
        let mut t = NetworkTrace::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let a = t.get_sql_server(ip, 1433);
        let b = t.get_sql_server(ip, 1433);
        assert_eq!(a, b);
        assert_eq!(t.sql_servers.len(), 1);
    }
}
