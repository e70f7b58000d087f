use std::net::{IpAddr, Ipv4Addr};

use super::{ConvId, FrameId};

/// One epoch of a bidirectional TCP or UDP flow.
///
/// The "source" side is provisionally the originator; the direction
/// normalization pass and the TDS evidence vote may swap it, flipping the
/// direction tag on every owned frame at the same time so the two stay
/// consistent.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub source_mac: u64,
    pub dest_mac: u64,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    pub is_udp: bool,
    /// Frames in arrival order, append-only.
    pub frames: Vec<FrameId>,

    // Transport statistics, accumulated during decode.
    pub total_bytes: u64,
    pub start_ticks: u64,
    pub end_ticks: u64,
    pub source_frames: u32,
    pub dest_frames: u32,
    pub ack_count: u32,
    pub push_count: u32,
    pub reset_count: u32,
    pub syn_count: u32,
    pub fin_count: u32,
    pub keep_alive_count: u32,
    pub duplicate_count: u32,
    pub raw_retransmits: u32,
    pub sig_retransmits: u32,
    pub keep_alive_retransmits: u32,
    pub truncation_error_count: u32,
    /// First captured length seen short of the wire length, 0 when the
    /// capture is complete.
    pub truncated_frame_length: u32,
    pub syn_time: Option<u64>,
    pub syn_ack_time: Option<u64>,
    pub fin_time: Option<u64>,
    pub reset_time: Option<u64>,

    // SMP multiplexing observations.
    pub smp_syn_count: u32,
    pub smp_ack_count: u32,
    pub smp_fin_count: u32,
    pub smp_data_count: u32,
    pub smp_max_session: u16,
    pub smp_fin_time: Option<u64>,

    // TDS/TLS session facts, accumulated by the reconstructor. These are
    // monotonic evidence flags: once set they stay set.
    pub has_tds: bool,
    pub is_sql: bool,
    pub has_tds8: bool,
    pub tds_frames: u32,
    pub is_encrypted: bool,
    pub is_enc_required: bool,
    pub is_mars_enabled: bool,
    pub has_prelogin: bool,
    pub has_prelogin_response: bool,
    pub has_client_hello: bool,
    pub has_server_hello: bool,
    pub has_key_exchange: bool,
    pub has_cipher_exchange: bool,
    pub has_application_data: bool,
    pub has_login7: bool,
    pub has_integrated_security: bool,
    pub has_sspi: bool,
    pub has_ntlm_challenge: bool,
    pub has_ntlm_response: bool,
    pub has_null_ntlm_creds: bool,
    pub has_post_login_response: bool,
    pub has_low_tls_version: bool,
    pub has_diffie_hellman: bool,
    pub has_redirected_connection: bool,

    pub prelogin_time: Option<u64>,
    pub prelogin_response_time: Option<u64>,
    pub client_hello_time: Option<u64>,
    pub server_hello_time: Option<u64>,
    pub key_exchange_time: Option<u64>,
    pub cipher_exchange_time: Option<u64>,
    pub login_time: Option<u64>,
    pub sspi_time: Option<u64>,
    pub ntlm_challenge_time: Option<u64>,
    pub ntlm_response_time: Option<u64>,
    pub login_ack_time: Option<u64>,
    pub attention_time: Option<u64>,
    pub error_time: Option<u64>,

    pub client_version: Option<String>,
    pub server_version: Option<String>,
    pub tds_version_client: u32,
    pub tds_version_server: u32,
    pub tls_version_client: Option<String>,
    pub tls_version_server: Option<String>,
    pub thread_id: u32,
    pub database_name: Option<String>,
    pub server_name: Option<String>,
    pub redirect_server: Option<String>,
    pub redirect_port: u16,
    pub error: u32,
    pub error_state: u8,
    pub error_msg: Option<String>,
}

impl Conversation {
    pub fn new(source_ip: IpAddr, source_port: u16, dest_ip: IpAddr, dest_port: u16) -> Self {
        Self {
            source_mac: 0,
            dest_mac: 0,
            source_ip,
            source_port,
            dest_ip,
            dest_port,
            is_udp: false,
            frames: Vec::new(),
            total_bytes: 0,
            start_ticks: 0,
            end_ticks: 0,
            source_frames: 0,
            dest_frames: 0,
            ack_count: 0,
            push_count: 0,
            reset_count: 0,
            syn_count: 0,
            fin_count: 0,
            keep_alive_count: 0,
            duplicate_count: 0,
            raw_retransmits: 0,
            sig_retransmits: 0,
            keep_alive_retransmits: 0,
            truncation_error_count: 0,
            truncated_frame_length: 0,
            syn_time: None,
            syn_ack_time: None,
            fin_time: None,
            reset_time: None,
            smp_syn_count: 0,
            smp_ack_count: 0,
            smp_fin_count: 0,
            smp_data_count: 0,
            smp_max_session: 0,
            smp_fin_time: None,
            has_tds: false,
            is_sql: false,
            has_tds8: false,
            tds_frames: 0,
            is_encrypted: false,
            is_enc_required: false,
            is_mars_enabled: false,
            has_prelogin: false,
            has_prelogin_response: false,
            has_client_hello: false,
            has_server_hello: false,
            has_key_exchange: false,
            has_cipher_exchange: false,
            has_application_data: false,
            has_login7: false,
            has_integrated_security: false,
            has_sspi: false,
            has_ntlm_challenge: false,
            has_ntlm_response: false,
            has_null_ntlm_creds: false,
            has_post_login_response: false,
            has_low_tls_version: false,
            has_diffie_hellman: false,
            has_redirected_connection: false,
            prelogin_time: None,
            prelogin_response_time: None,
            client_hello_time: None,
            server_hello_time: None,
            key_exchange_time: None,
            cipher_exchange_time: None,
            login_time: None,
            sspi_time: None,
            ntlm_challenge_time: None,
            ntlm_response_time: None,
            login_ack_time: None,
            attention_time: None,
            error_time: None,
            client_version: None,
            server_version: None,
            tds_version_client: 0,
            tds_version_server: 0,
            tls_version_client: None,
            tls_version_server: None,
            thread_id: 0,
            database_name: None,
            server_name: None,
            redirect_server: None,
            redirect_port: 0,
            error: 0,
            error_state: 0,
            error_msg: None,
        }
    }

    /// New conversation for a reused 4-tuple, cloning only the durable
    /// identity fields.
    pub fn new_epoch(&self) -> Self {
        let mut next = Conversation::new(
            self.source_ip,
            self.source_port,
            self.dest_ip,
            self.dest_port,
        );
        next.source_mac = self.source_mac;
        next.dest_mac = self.dest_mac;
        next.is_udp = self.is_udp;
        next
    }

    pub fn is_ipv6(&self) -> bool {
        self.source_ip.is_ipv6()
    }

    /// The LOGINACK arrived after the connection was already closed: the
    /// login did not complete in time from the client's point of view.
    pub fn has_late_login_ack(&self) -> bool {
        let Some(ack) = self.login_ack_time else {
            return false;
        };
        if let Some(fin) = self.fin_time {
            if ack > fin {
                return true;
            }
        }
        if let Some(reset) = self.reset_time {
            if ack > reset {
                return true;
            }
        }
        false
    }

    /// Login-failure heuristic. The encrypted and unencrypted branches test
    /// different progress flags and are kept separate on purpose: existing
    /// reports depend on both rule sets as they stand.
    pub fn has_login_failure(&self) -> bool {
        if self.has_late_login_ack() {
            return true;
        }
        let closed = self.reset_count > 0 || self.fin_count > 0;
        if self.is_encrypted {
            !self.has_application_data
                && closed
                && (self.syn_count > 0
                    || self.has_prelogin
                    || self.has_prelogin_response
                    || self.has_client_hello
                    || self.has_server_hello
                    || self.has_key_exchange
                    || self.has_cipher_exchange
                    || self.has_ntlm_challenge
                    || self.has_ntlm_response)
        } else {
            !self.has_post_login_response
                && closed
                && (self.syn_count > 0
                    || self.has_prelogin
                    || self.has_prelogin_response
                    || self.has_client_hello
                    || self.has_server_hello
                    || self.has_key_exchange
                    || self.has_cipher_exchange
                    || self.has_ntlm_challenge
                    || self.has_ntlm_response
                    || self.has_application_data)
        }
    }

    /// The eight milestone flags the SQL judgment counts.
    pub fn milestone_count(&self) -> u32 {
        [
            self.has_prelogin,
            self.has_prelogin_response,
            self.has_client_hello,
            self.has_server_hello,
            self.has_key_exchange,
            self.has_cipher_exchange,
            self.has_login7 || self.has_application_data,
            self.has_post_login_response,
        ]
        .iter()
        .filter(|&&b| b)
        .count() as u32
    }

    /// Compact per-step flag string used in conversation listings.
    pub fn login_flag_string(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}{}{}{}",
            if self.syn_count > 0 { "S " } else { "  " },
            if self.has_prelogin { "PL " } else { "   " },
            if self.has_prelogin_response { "PR " } else { "   " },
            if self.has_client_hello { "CH " } else { "   " },
            if self.has_server_hello { "SH " } else { "   " },
            if self.has_key_exchange { "KE " } else { "   " },
            if self.has_cipher_exchange { "CE " } else { "   " },
            if self.has_application_data { "AD " } else { "   " },
            if self.has_ntlm_challenge { "NC " } else { "   " },
            if self.has_ntlm_response { "NR" } else { "  " },
        )
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end_ticks.saturating_sub(self.start_ticks) as f64 / 1e7
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Conversation::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        )
    }
}

/// A logical SQL Server endpoint aggregating every conversation whose
/// session evidence put it on the server side.
#[derive(Debug, Clone)]
pub struct SqlServer {
    pub ip: IpAddr,
    pub port: u16,
    pub conversations: Vec<ConvId>,
}

impl SqlServer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            conversations: Vec::new(),
        }
    }
}
