use super::{ConvId, FrameId};

/// TCP flag bits as they appear in the header flags byte.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RESET: u8 = 0x04;
    pub const PUSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URGENT: u8 = 0x20;
}

/// Session-establishment step a payload was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Unknown,
    PreLogin,
    PreLoginResponse,
    ClientHello,
    ServerHello,
    KeyExchange,
    CipherChange,
    ApplicationData,
    Login7,
    Sspi,
    NtlmChallenge,
    NtlmResponse,
    LoginAck,
    LoginError,
    CommandError,
    TabularResponse,
    RpcRequest,
    SqlBatch,
    XactMgrRequest,
    Attention,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Unknown => "",
            FrameType::PreLogin => "PreLogin",
            FrameType::PreLoginResponse => "PreLoginResponse",
            FrameType::ClientHello => "ClientHello",
            FrameType::ServerHello => "ServerHello",
            FrameType::KeyExchange => "KeyExchange",
            FrameType::CipherChange => "CipherChange",
            FrameType::ApplicationData => "ApplicationData",
            FrameType::Login7 => "Login7",
            FrameType::Sspi => "SSPI",
            FrameType::NtlmChallenge => "NTLMChallenge",
            FrameType::NtlmResponse => "NTLMResponse",
            FrameType::LoginAck => "LoginAck",
            FrameType::LoginError => "LoginError",
            FrameType::CommandError => "CommandError",
            FrameType::TabularResponse => "Response",
            FrameType::RpcRequest => "RPC",
            FrameType::SqlBatch => "SQLBatch",
            FrameType::XactMgrRequest => "DTC",
            FrameType::Attention => "Attention",
        }
    }
}

/// One captured packet as seen by the pipeline.
///
/// Created once during decode; the classification and derived anomaly flags
/// are filled in by the later passes and never change afterwards.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 1-based sequence number within the owning capture file.
    pub frame_no: u32,
    /// Index into [`super::NetworkTrace::files`].
    pub file_ix: usize,
    /// Capture timestamp, 100 ns ticks.
    pub ticks: u64,
    /// Length on the wire.
    pub frame_length: u32,
    /// Bytes actually captured (may be less when the capture truncates).
    pub captured_length: u32,
    /// Owning conversation.
    pub conversation: ConvId,
    pub is_udp: bool,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: u8,
    pub window_size: u16,
    /// IPv4 identification field; `None` for IPv6 frames.
    pub ipv4_ident: Option<u16>,
    /// SMP multiplex session id when an SMP header preceded the payload.
    pub smp_session: Option<u16>,
    /// Transport payload (after any SMP header). Empty when none captured.
    pub payload: Vec<u8>,
    /// Direction relative to the conversation's nominal source endpoint.
    pub is_from_client: bool,
    pub frame_type: FrameType,
    pub is_retransmit: bool,
    /// Canonical original frame of this retransmit.
    pub retransmit_of: Option<FrameId>,
    /// Number of later frames marked as retransmits of this one.
    pub retransmit_count: u32,
    pub is_keep_alive: bool,
    pub is_keep_alive_retransmit: bool,
    pub keep_alive_of: Option<FrameId>,
    pub is_continuation: bool,
}

impl Frame {
    pub fn new(frame_no: u32, file_ix: usize, ticks: u64) -> Self {
        Self {
            frame_no,
            file_ix,
            ticks,
            frame_length: 0,
            captured_length: 0,
            conversation: 0,
            is_udp: false,
            seq_no: 0,
            ack_no: 0,
            flags: 0,
            window_size: 0,
            ipv4_ident: None,
            smp_session: None,
            payload: Vec::new(),
            is_from_client: false,
            frame_type: FrameType::Unknown,
            is_retransmit: false,
            retransmit_of: None,
            retransmit_count: 0,
            is_keep_alive: false,
            is_keep_alive_retransmit: false,
            keep_alive_of: None,
            is_continuation: false,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn has_fin(&self) -> bool {
        self.flags & tcp_flags::FIN != 0
    }

    pub fn has_syn(&self) -> bool {
        self.flags & tcp_flags::SYN != 0
    }

    pub fn has_reset(&self) -> bool {
        self.flags & tcp_flags::RESET != 0
    }

    pub fn has_push(&self) -> bool {
        self.flags & tcp_flags::PUSH != 0
    }

    pub fn has_ack(&self) -> bool {
        self.flags & tcp_flags::ACK != 0
    }

    /// Bare SYN, ignoring the ECN bits that captures sometimes carry.
    pub fn is_bare_syn(&self) -> bool {
        self.has_syn() && !self.has_ack()
    }

    pub fn is_syn_ack(&self) -> bool {
        self.has_syn() && self.has_ack()
    }

    /// `A....` / `AP..F` style flag string for the report.
    pub fn flag_string(&self) -> String {
        let mut s = String::with_capacity(5);
        s.push(if self.has_ack() { 'A' } else { '.' });
        s.push(if self.has_push() { 'P' } else { '.' });
        s.push(if self.has_reset() { 'R' } else { '.' });
        s.push(if self.has_syn() { 'S' } else { '.' });
        s.push(if self.has_fin() { 'F' } else { '.' });
        s
    }
}
