//! Report model built from the finished conversation graph.
//!
//! The report is the read-only contract with the rendering layer: every
//! sequence is deterministically ordered, timestamps are RFC 3339, and the
//! formatting helpers here are the ones the renderers call so address and
//! flag text stays consistent between the human-readable and CSV outputs.

use std::net::IpAddr;

use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::diag::{DiagEvent, Diagnostics};
use crate::model::{Conversation, NetworkTrace};

/// Current report schema version.
pub const REPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub report_version: u32,
    pub tool: ToolInfo,
    /// RFC 3339 timestamp of the last captured frame, standing in for the
    /// generation time so output is deterministic.
    pub generated_at: Option<String>,
    pub inputs: Vec<InputInfo>,
    pub totals: Totals,
    pub sql_servers: Vec<SqlServerSummary>,
    pub diagnostics: Vec<DiagEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputInfo {
    pub path: String,
    pub bytes: u64,
    pub frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_end: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Totals {
    pub frames: u64,
    pub conversations: u64,
    pub tcp_conversations: u64,
    pub udp_conversations: u64,
    pub sql_conversations: u64,
    pub truncation_errors: u64,
    pub capture_duplicates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlServerSummary {
    /// `ip:port` of the server endpoint.
    pub endpoint: String,
    pub conversation_count: u64,
    pub login_failures: u64,
    pub redirected_logins: u64,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub client: String,
    pub server: String,
    /// Compact per-step flag string (`S PL PR CH SH ...`).
    pub login_flags: String,
    pub frames: u64,
    pub duration_seconds: f64,
    pub syn_count: u32,
    pub fin_count: u32,
    pub reset_count: u32,
    pub raw_retransmits: u32,
    pub sig_retransmits: u32,
    pub keep_alives: u32,
    pub keep_alive_retransmits: u32,
    pub capture_duplicates: u32,
    pub truncation_errors: u32,
    pub encrypted: bool,
    pub mars: bool,
    pub integrated_security: bool,
    pub null_credentials: bool,
    pub tds_version_client: String,
    pub tds_version_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version_client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version_server: Option<String>,
    pub low_tls_version: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub milestones: Milestones,
    pub post_login_response: bool,
    pub late_login_ack: bool,
    pub login_failure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub number: u32,
    pub state: u8,
    pub message: String,
}

/// Milestone timestamps, each recorded at most once per conversation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Milestones {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syn_ack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prelogin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prelogin_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_hello: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_hello: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cipher_exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ntlm_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ntlm_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_ack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<String>,
}

/// Assemble the report from a finished trace.
pub fn build_report(trace: &NetworkTrace, diag: &Diagnostics) -> Report {
    let inputs: Vec<InputInfo> = trace
        .files
        .iter()
        .map(|f| InputInfo {
            path: f.path.clone(),
            bytes: f.size,
            frames: f.frame_count,
            time_start: ticks_to_rfc3339(nonzero(f.start_ticks)),
            time_end: ticks_to_rfc3339(nonzero(f.end_ticks)),
        })
        .collect();

    let totals = Totals {
        frames: trace.frames.len() as u64,
        conversations: trace.conversations.len() as u64,
        tcp_conversations: trace.conversations.iter().filter(|c| !c.is_udp).count() as u64,
        udp_conversations: trace.conversations.iter().filter(|c| c.is_udp).count() as u64,
        sql_conversations: trace.conversations.iter().filter(|c| c.is_sql).count() as u64,
        truncation_errors: trace
            .conversations
            .iter()
            .map(|c| u64::from(c.truncation_error_count))
            .sum(),
        capture_duplicates: trace
            .conversations
            .iter()
            .map(|c| u64::from(c.duplicate_count))
            .sum(),
    };

    let generated_at = ticks_to_rfc3339(
        trace
            .files
            .iter()
            .map(|f| f.end_ticks)
            .max()
            .filter(|&t| t > 0),
    );

    let mut sql_servers: Vec<SqlServerSummary> = trace
        .sql_servers
        .iter()
        .map(|server| {
            let mut conversations: Vec<ConversationSummary> = server
                .conversations
                .iter()
                .map(|&ci| summarize_conversation(&trace.conversations[ci]))
                .collect();
            conversations.sort_by(|a, b| a.client.cmp(&b.client));
            SqlServerSummary {
                endpoint: format_endpoint(server.ip, server.port),
                conversation_count: conversations.len() as u64,
                login_failures: conversations.iter().filter(|c| c.login_failure).count() as u64,
                redirected_logins: conversations.iter().filter(|c| c.redirect.is_some()).count()
                    as u64,
                conversations,
            }
        })
        .collect();
    sql_servers.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

    Report {
        report_version: REPORT_VERSION,
        tool: ToolInfo {
            name: "sqltrace".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        generated_at,
        inputs,
        totals,
        sql_servers,
        diagnostics: diag.events().to_vec(),
    }
}

fn summarize_conversation(c: &Conversation) -> ConversationSummary {
    ConversationSummary {
        client: format_endpoint(c.source_ip, c.source_port),
        server: format_endpoint(c.dest_ip, c.dest_port),
        login_flags: c.login_flag_string(),
        frames: c.frames.len() as u64,
        duration_seconds: c.duration_seconds(),
        syn_count: c.syn_count,
        fin_count: c.fin_count,
        reset_count: c.reset_count,
        raw_retransmits: c.raw_retransmits,
        sig_retransmits: c.sig_retransmits,
        keep_alives: c.keep_alive_count,
        keep_alive_retransmits: c.keep_alive_retransmits,
        capture_duplicates: c.duplicate_count,
        truncation_errors: c.truncation_error_count,
        encrypted: c.is_encrypted,
        mars: c.is_mars_enabled,
        integrated_security: c.has_integrated_security,
        null_credentials: c.has_null_ntlm_creds,
        tds_version_client: friendly_tds_version_client(c.tds_version_client, c.is_sql),
        tds_version_server: friendly_tds_version_server(c.tds_version_server, c.is_sql),
        tls_version_client: c.tls_version_client.clone(),
        tls_version_server: c.tls_version_server.clone(),
        low_tls_version: c.has_low_tls_version,
        database: c.database_name.clone(),
        server_name: c.server_name.clone(),
        server_version: c.server_version.clone(),
        redirect: c
            .redirect_server
            .as_ref()
            .map(|s| format!("{}:{}", s, c.redirect_port)),
        error: (c.error != 0).then(|| ErrorSummary {
            number: c.error,
            state: c.error_state,
            message: c.error_msg.clone().unwrap_or_default(),
        }),
        milestones: Milestones {
            syn: ticks_to_rfc3339(c.syn_time),
            syn_ack: ticks_to_rfc3339(c.syn_ack_time),
            prelogin: ticks_to_rfc3339(c.prelogin_time),
            prelogin_response: ticks_to_rfc3339(c.prelogin_response_time),
            client_hello: ticks_to_rfc3339(c.client_hello_time),
            server_hello: ticks_to_rfc3339(c.server_hello_time),
            key_exchange: ticks_to_rfc3339(c.key_exchange_time),
            cipher_exchange: ticks_to_rfc3339(c.cipher_exchange_time),
            login: ticks_to_rfc3339(c.login_time),
            ntlm_challenge: ticks_to_rfc3339(c.ntlm_challenge_time),
            ntlm_response: ticks_to_rfc3339(c.ntlm_response_time),
            login_ack: ticks_to_rfc3339(c.login_ack_time),
            attention: ticks_to_rfc3339(c.attention_time),
            error: ticks_to_rfc3339(c.error_time),
            fin: ticks_to_rfc3339(c.fin_time),
            reset: ticks_to_rfc3339(c.reset_time),
        },
        post_login_response: c.has_post_login_response,
        late_login_ack: c.has_late_login_ack(),
        login_failure: c.has_login_failure(),
    }
}

/// `ip:port`, with IPv6 addresses bracketed.
pub fn format_endpoint(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(addr) => format!("{addr}:{port}"),
        IpAddr::V6(addr) => format!("[{addr}]:{port}"),
    }
}

/// 100 ns ticks since the Unix epoch to RFC 3339.
pub fn ticks_to_rfc3339(ticks: Option<u64>) -> Option<String> {
    let ticks = ticks?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ticks) * 100)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}

fn nonzero(ticks: u64) -> Option<u64> {
    (ticks > 0).then_some(ticks)
}

/// Server-reported TDS version codes from the LOGINACK token. These differ
/// from the client-side codes.
pub fn friendly_tds_version_server(version: u32, is_sql: bool) -> String {
    match version {
        0 => {
            if is_sql {
                "Unknown".to_string()
            } else {
                String::new()
            }
        }
        0x0700_0000 => "7.0 (SQL 7.0)".to_string(),
        0x0701_0000 => "7.1 (SQL 2000)".to_string(),
        0x7100_0001 => "7.1 (SQL 2000 SP1)".to_string(),
        0x7209_0002 => "7.2 (SQL 2005)".to_string(),
        0x730A_0003 => "7.3 (SQL 2008)".to_string(),
        0x730B_0003 => "7.3 (SQL 2008 R2)".to_string(),
        0x7400_0004 => "7.4 (SQL 2012+)".to_string(),
        other => format!("{other:08X}"),
    }
}

/// Client-announced TDS version codes from the LOGIN7 packet.
pub fn friendly_tds_version_client(version: u32, is_sql: bool) -> String {
    match version {
        0 => {
            if is_sql {
                "Unknown".to_string()
            } else {
                String::new()
            }
        }
        0x0000_0070 => "7.0 (SQL 7.0)".to_string(),
        0x0000_0071 => "7.1 (SQL 2000)".to_string(),
        0x0100_0071 => "7.1 (SQL 2000 SP1)".to_string(),
        0x0200_0972 => "7.2 (SQL 2005)".to_string(),
        0x0300_0A73 => "7.3 (SQL 2008)".to_string(),
        0x0300_0B73 => "7.3 (SQL 2008 R2)".to_string(),
        0x0400_0074 => "7.4 (SQL 2012+)".to_string(),
        other => format!("{other:08X}"),
    }
}
