//! TDS session reconstructor.
//!
//! Walks each conversation's frame sequence after the TCP passes and
//! classifies payload-bearing segments into session-establishment steps,
//! recording per-step milestone timestamps and accumulating role evidence.
//! Real traces are noisy: packets arrive out of the expected order, client
//! libraries skip steps, and the same byte patterns occur on non-SQL
//! traffic, so classification is evidence-based rather than a strict state
//! machine.

pub mod prelogin;
pub mod tokens;

use crate::diag::{DiagKind, Diagnostics};
use crate::model::{AnalysisOptions, ConvId, FrameType, NetworkTrace};
use crate::tls;

use tokens::{HEADER_LEN, packet_type, token};

/// Evidence accumulated per conversation about which side is the server.
#[derive(Debug, Default)]
struct RoleEvidence {
    client_source: u32,
    client_dest: u32,
    server_source: u32,
    server_dest: u32,
    other: u32,
    /// Votes to swap roles, raised by key frames seen from the wrong side
    /// while login is still in progress.
    switch: u32,
}

impl RoleEvidence {
    fn total(&self) -> u32 {
        self.client_source + self.client_dest + self.server_source + self.server_dest
    }

    fn server_on_dest(&self) -> u32 {
        self.client_source + self.server_dest
    }

    fn server_on_source(&self) -> u32 {
        self.client_dest + self.server_source
    }
}

/// Classify every conversation's TDS traffic, decide which are SQL, settle
/// direction, and build the SQL Server roll-ups.
pub(crate) fn process_tds(
    trace: &mut NetworkTrace,
    opts: &AnalysisOptions,
    diag: &mut Diagnostics,
) {
    for ci in 0..trace.conversations.len() {
        if trace.conversations[ci].is_udp {
            continue;
        }
        // SQL Server does not configure itself below the well-known port
        // range; skipping it avoids mistaking encrypted HTTPS or Kerberos
        // for TDS.
        {
            let c = &trace.conversations[ci];
            if c.source_port < opts.sql_port_floor || c.dest_port < opts.sql_port_floor {
                continue;
            }
        }

        let evidence = scan_conversation(trace, ci);
        judge_conversation(trace, ci, evidence, diag);
    }
}

fn scan_conversation(trace: &mut NetworkTrace, ci: ConvId) -> RoleEvidence {
    let mut ev = RoleEvidence::default();
    let frame_ids = trace.conversations[ci].frames.clone();

    for fid in frame_ids {
        let c = &mut trace.conversations[ci];
        let f = &trace.frames[fid];
        let mut ft: Option<FrameType> = None;

        if f.payload_len() < 8 || f.is_continuation {
            continue;
        }
        let payload = &f.payload;
        if starts_with_ignore_case(payload, b"GET")
            || starts_with_ignore_case(payload, b"POST")
            || starts_with_ignore_case(payload, b"HTTP")
        {
            break; // HTTP on this port pair, the whole conversation is out
        }
        let first_byte = payload[0];
        if !packet_type::is_known(first_byte) {
            continue;
        }

        // TDS header sanity for the header-bearing types. TLS records and
        // application data at the top level carry no TDS header.
        if !matches!(
            first_byte,
            packet_type::TDS8_TLS | packet_type::TDS8_CCS | packet_type::APP_DATA
        ) {
            let Ok(tds_length) = crate::bytes::u16_be_at(payload, 2) else {
                continue;
            };
            if tds_length == 0 || (tds_length as usize) < f.payload_len() {
                continue;
            }
            if payload[6] > 1 {
                continue; // continued-response packet ids are out of scope
            }
            if payload[7] != 0 {
                continue; // reserved window byte
            }
        }

        let ticks = f.ticks;
        let from_client = f.is_from_client;
        let pre_login_phase = !c.has_application_data && !c.has_post_login_response;

        match first_byte {
            packet_type::TDS8_TLS => {
                let Some(record) = tls::parse(payload, 0) else {
                    continue;
                };
                if record.has_client_hello() {
                    ft = Some(FrameType::ClientHello);
                    if let Some(hello) = record.hello() {
                        c.tls_version_client = Some(tls::version_name(hello.version));
                    }
                    if !from_client {
                        ev.switch += 1;
                    }
                    if record.is_tds8() {
                        c.has_tds8 = true;
                        if c.server_name.is_none() {
                            c.server_name =
                                record.hello().and_then(|h| h.server_name.clone());
                        }
                        c.has_client_hello = true;
                        c.client_hello_time.get_or_insert(ticks);
                        if let Some(hello) = record.hello() {
                            if tls::is_low_version(hello.version) {
                                c.has_low_tls_version = true;
                            }
                        }
                        if from_client {
                            ev.client_source += 1;
                        } else {
                            ev.client_dest += 1;
                        }
                    }
                } else if record.has_server_hello() {
                    ft = Some(FrameType::ServerHello);
                    if from_client {
                        ev.switch += 1;
                    }
                    if let Some(hello) = record.hello() {
                        c.tls_version_server = Some(tls::version_name(hello.version));
                        if let Some(suite) = hello.cipher_suite {
                            if tls::is_dhe_cipher_suite(suite) {
                                c.has_diffie_hellman = true;
                            }
                        }
                    }
                    if record.is_tds8() {
                        c.has_tds8 = true;
                        c.has_server_hello = true;
                        c.server_hello_time.get_or_insert(ticks);
                        if let Some(hello) = record.hello() {
                            if tls::is_low_version(hello.version) {
                                c.has_low_tls_version = true;
                            }
                        }
                        if from_client {
                            ev.server_source += 1;
                        } else {
                            ev.server_dest += 1;
                        }
                    }
                } else if record.has_client_key_exchange() {
                    ft = Some(FrameType::KeyExchange);
                    if c.has_tds8 {
                        c.key_exchange_time.get_or_insert(ticks);
                        c.has_key_exchange = true;
                        if from_client {
                            ev.client_source += 1;
                        } else {
                            ev.client_dest += 1;
                            ev.switch += 1;
                        }
                    }
                }
            }
            packet_type::TDS8_CCS => {
                ft = Some(FrameType::CipherChange);
                if c.has_tds8 {
                    c.has_cipher_exchange = true;
                    c.cipher_exchange_time.get_or_insert(ticks);
                    ev.other += 1; // either side sends cipher change
                }
            }
            packet_type::APP_DATA => {
                let version = ((payload[1] as u16) << 8) | payload[2] as u16;
                if tls::is_valid_version(version) {
                    c.has_application_data = true;
                    ft = Some(FrameType::ApplicationData);
                    c.login_time.get_or_insert(ticks);
                    ev.other += 1; // either side sends encrypted data
                }
            }
            packet_type::PRELOGIN => {
                let Some(&sub_type) = payload.get(HEADER_LEN) else {
                    continue;
                };
                match sub_type {
                    0 => {
                        prelogin::apply_client_prelogin(payload, c);
                        c.has_prelogin = true;
                        ft = Some(FrameType::PreLogin);
                        c.prelogin_time.get_or_insert(ticks);
                        if from_client {
                            ev.client_source += 1;
                        } else {
                            if pre_login_phase {
                                ev.switch += 1;
                            }
                            ev.client_dest += 1;
                        }
                    }
                    tls::CONTENT_HANDSHAKE => {
                        let Some(record) = tls::parse(payload, HEADER_LEN) else {
                            continue;
                        };
                        if record.has_client_hello() {
                            c.has_client_hello = true;
                            ft = Some(FrameType::ClientHello);
                            c.client_hello_time.get_or_insert(ticks);
                            if let Some(hello) = record.hello() {
                                c.tls_version_client = Some(tls::version_name(hello.version));
                                if tls::is_low_version(hello.version) {
                                    c.has_low_tls_version = true;
                                }
                            }
                            if from_client {
                                ev.client_source += 1;
                            } else {
                                if pre_login_phase {
                                    ev.switch += 1;
                                }
                                ev.client_dest += 1;
                            }
                        } else if record.has_client_key_exchange() {
                            c.key_exchange_time.get_or_insert(ticks);
                            c.has_key_exchange = true;
                            ft = Some(FrameType::KeyExchange);
                            if from_client {
                                ev.client_source += 1;
                            } else {
                                if pre_login_phase {
                                    ev.switch += 1;
                                }
                                ev.client_dest += 1;
                            }
                        } else if record.has_server_hello() {
                            ft = Some(FrameType::ServerHello);
                            apply_server_hello(c, &record, ticks);
                            if from_client {
                                ev.server_source += 1;
                            } else {
                                ev.server_dest += 1;
                            }
                        }
                    }
                    tls::CONTENT_CIPHER_CHANGE => {
                        c.has_cipher_exchange = true;
                        ft = Some(FrameType::CipherChange);
                        c.cipher_exchange_time.get_or_insert(ticks);
                        ev.other += 1;
                    }
                    _ => {}
                }
            }
            packet_type::LOGIN | packet_type::LOGIN7 => {
                // an unencrypted credential exchange, which should only
                // appear when TLS is disabled end to end
                if !c.has_client_hello
                    && !c.has_server_hello
                    && !c.has_key_exchange
                    && !c.has_cipher_exchange
                    && !c.has_post_login_response
                    && c.error == 0
                {
                    c.has_login7 = true;
                    ft = Some(FrameType::Login7);
                    c.login_time.get_or_insert(ticks);
                }
                if from_client {
                    ev.client_source += 1;
                } else {
                    ev.client_dest += 1;
                }
            }
            packet_type::SSPI => {
                c.has_integrated_security = true;
                if f.payload_len() > 16 {
                    if tokens::is_ntlm_response(payload) {
                        c.has_ntlm_response = true;
                        ft = Some(FrameType::NtlmResponse);
                        c.ntlm_response_time.get_or_insert(ticks);
                        if tokens::has_null_ntlm_credentials(payload) {
                            c.has_null_ntlm_creds = true;
                        }
                        if !from_client && pre_login_phase {
                            ev.switch += 1;
                        }
                    } else {
                        // no NTLM signature, so Kerberos
                        c.has_sspi = true;
                        ft = Some(FrameType::Sspi);
                        c.sspi_time.get_or_insert(ticks);
                    }
                }
                if from_client {
                    ev.client_source += 1;
                } else {
                    ev.client_dest += 1;
                }
            }
            packet_type::RPC | packet_type::SQLBATCH | packet_type::DTC => {
                // real query traffic: login already succeeded
                c.has_post_login_response = true;
                ft = Some(match first_byte {
                    packet_type::RPC => FrameType::RpcRequest,
                    packet_type::SQLBATCH => FrameType::SqlBatch,
                    _ => FrameType::XactMgrRequest,
                });
                if from_client {
                    ev.client_source += 1;
                } else {
                    ev.client_dest += 1;
                }
            }
            packet_type::ATTENTION => {
                if f.payload_len() == 8 {
                    c.has_post_login_response = true;
                    ft = Some(FrameType::Attention);
                    c.attention_time.get_or_insert(ticks);
                    if from_client {
                        ev.client_source += 1;
                    } else {
                        ev.client_dest += 1;
                    }
                }
            }
            packet_type::RESPONSE => {
                let Some(&first_token) = payload.get(HEADER_LEN) else {
                    continue;
                };
                ft = Some(FrameType::TabularResponse);
                if first_token == token::ERROR {
                    ft = Some(FrameType::CommandError);
                    // command-execution errors after login are not login
                    // failures
                    if c.error == 0 && !c.has_post_login_response {
                        ft = Some(FrameType::LoginError);
                        if let Some(err) = tokens::parse_error_token(payload) {
                            c.error = err.number;
                            c.error_state = err.state;
                            c.error_msg = Some(err.message);
                            c.error_time.get_or_insert(ticks);
                        }
                    }
                } else if first_token == token::PRELOGIN_RESPONSE {
                    prelogin::apply_server_prelogin(payload, c);
                    c.has_prelogin_response = true;
                    ft = Some(FrameType::PreLoginResponse);
                    c.prelogin_response_time.get_or_insert(ticks);
                    if from_client && pre_login_phase {
                        ev.switch += 1;
                    }
                } else if first_token == tls::CONTENT_HANDSHAKE && f.payload_len() > 10 {
                    if let Some(record) = tls::parse(payload, HEADER_LEN) {
                        if record.has_server_hello() {
                            ft = Some(FrameType::ServerHello);
                            apply_server_hello(c, &record, ticks);
                        }
                    }
                } else if tokens::is_ntlm_challenge(payload) {
                    c.has_ntlm_challenge = true;
                    ft = Some(FrameType::NtlmChallenge);
                    c.ntlm_challenge_time.get_or_insert(ticks);
                    if !from_client && pre_login_phase {
                        ev.switch += 1;
                    }
                } else if f.payload_len() > 19 && first_token == token::SSPI {
                    c.has_sspi = true;
                    ft = Some(FrameType::Sspi);
                    c.sspi_time.get_or_insert(ticks);
                } else if token_trio_present(payload) {
                    c.has_post_login_response = true;
                    ft = Some(FrameType::LoginAck);
                    c.login_ack_time.get_or_insert(ticks);
                    if let Some(at) = tokens::token_offset(payload, token::LOGINACK, HEADER_LEN) {
                        if let Some(ack) = tokens::parse_login_ack(payload, at) {
                            c.tds_version_server = ack.tds_version;
                            c.server_version = Some(ack.server_version);
                        }
                    }
                    if let Some(at) = tokens::token_offset(payload, token::INFO, HEADER_LEN) {
                        if let Some(name) = tokens::parse_info_server_name(payload, at) {
                            c.server_name = Some(name);
                        }
                    }
                    let env = tokens::parse_env_changes(payload);
                    if env.database.is_some() {
                        c.database_name = env.database;
                    }
                    if let Some(server) = env.redirect_server {
                        c.redirect_server = Some(server);
                        c.redirect_port = env.redirect_port;
                        c.has_redirected_connection = true;
                    }
                    // no role-swap vote here: a login ack settles the
                    // conversation as post-login
                }
                if from_client {
                    ev.server_source += 1;
                } else {
                    ev.server_dest += 1;
                }
            }
            _ => {}
        }

        if let Some(kind) = ft {
            trace.frames[fid].frame_type = kind;
        }
    }
    ev
}

fn apply_server_hello(c: &mut crate::model::Conversation, record: &tls::TlsRecord, ticks: u64) {
    c.has_server_hello = true;
    c.server_hello_time.get_or_insert(ticks);
    if let Some(hello) = record.hello() {
        c.tls_version_server = Some(tls::version_name(hello.version));
        if tls::is_low_version(hello.version) {
            c.has_low_tls_version = true;
        }
        if let Some(suite) = hello.cipher_suite {
            if tls::is_dhe_cipher_suite(suite) {
                c.has_diffie_hellman = true;
            }
        }
    }
}

fn token_trio_present(payload: &[u8]) -> bool {
    tokens::token_offset(payload, token::ENVCHANGE, HEADER_LEN).is_some()
        && tokens::token_offset(payload, token::INFO, HEADER_LEN).is_some()
        && tokens::token_offset(payload, token::LOGINACK, HEADER_LEN).is_some()
}

/// SQL judgment, role settlement, and server roll-up for one conversation.
fn judge_conversation(
    trace: &mut NetworkTrace,
    ci: ConvId,
    mut ev: RoleEvidence,
    diag: &mut Diagnostics,
) {
    let (key_frames, syn_count, frame_count, has_tds8) = {
        let c = &trace.conversations[ci];
        (
            c.milestone_count(),
            c.syn_count,
            c.frames.len() as u32,
            c.has_tds8,
        )
    };

    // Noise guards: a conversation whose start we saw but which produced
    // almost no key frames, or whose TDS-looking frames are under 2% of the
    // total, is almost certainly not SQL.
    if (syn_count > 0 && key_frames < 3) || ev.total() * 50 < frame_count {
        ev.client_source = 0;
        ev.client_dest = 0;
        ev.server_source = 0;
        ev.server_dest = 0;
    }

    let one_directional = (ev.server_on_dest() > 0 && ev.server_on_source() == 0)
        || (ev.server_on_source() > 0 && ev.server_on_dest() == 0);
    let is_sql = has_tds8 || key_frames >= 5 || one_directional;

    {
        let c = &mut trace.conversations[ci];
        c.is_sql = is_sql;
        c.has_tds = is_sql;
        if is_sql {
            c.tds_frames = ev.total() + ev.other;
        }
    }

    // Settle direction so the server ends up on the destination side.
    if ev.server_on_dest() > 0 && ev.server_on_source() == 0 {
        // already oriented correctly
    } else if ev.server_on_source() > 0 && ev.server_on_dest() == 0 {
        trace.reverse_source_dest(ci);
    } else if ev.switch > 0 {
        trace.reverse_source_dest(ci);
    } else if ev.server_on_source() > 0 && ev.server_on_dest() > 0 {
        // evidence on both sides: adopt only if a known server matches
        if trace.find_sql_server_for(ci).is_some() {
            let c = &mut trace.conversations[ci];
            c.is_sql = true;
            c.has_tds = true;
            c.tds_frames = ev.total() + ev.other;
        }
        let c = &trace.conversations[ci];
        diag.record(
            DiagKind::Ambiguity,
            format!(
                "TDS evidence on both sides of {}:{} <-> {}:{} (cs={} sd={} ss={} cd={})",
                c.source_ip,
                c.source_port,
                c.dest_ip,
                c.dest_port,
                ev.client_source,
                ev.server_dest,
                ev.server_source,
                ev.client_dest
            ),
        );
    }

    if trace.conversations[ci].is_sql {
        let (ip, port) = {
            let c = &trace.conversations[ci];
            (c.dest_ip, c.dest_port)
        };
        let six = trace.get_sql_server(ip, port);
        if !trace.sql_servers[six].conversations.contains(&ci) {
            trace.sql_servers[six].conversations.push(ci);
        }
    }
}

/// Non-SQL conversations whose endpoints match a known server are adopted:
/// they are SQL traffic that skipped the login milestones.
pub(crate) fn adopt_stray_conversations(trace: &mut NetworkTrace) {
    for ci in 0..trace.conversations.len() {
        if trace.conversations[ci].is_sql {
            continue;
        }
        let Some(six) = trace.find_sql_server_for(ci) else {
            continue;
        };
        let needs_reverse = {
            let c = &trace.conversations[ci];
            let s = &trace.sql_servers[six];
            c.dest_ip != s.ip || c.dest_port != s.port
        };
        trace.conversations[ci].is_sql = true;
        if needs_reverse {
            trace.reverse_source_dest(ci);
        }
        if !trace.sql_servers[six].conversations.contains(&ci) {
            trace.sql_servers[six].conversations.push(ci);
        }
    }
}

/// A "server" rolled up from a single conversation whose client endpoint
/// matches another known server was judged backwards: merge it away.
pub(crate) fn merge_stray_servers(trace: &mut NetworkTrace) {
    for six in 0..trace.sql_servers.len() {
        if trace.sql_servers[six].conversations.len() != 1 {
            continue;
        }
        let ci = trace.sql_servers[six].conversations[0];
        let (src_ip, src_port) = {
            let c = &trace.conversations[ci];
            (c.source_ip, c.source_port)
        };
        let Some(other) = trace.find_sql_server(src_ip, src_port) else {
            continue;
        };
        if other == six {
            continue;
        }
        trace.reverse_source_dest(ci);
        trace.sql_servers[other].conversations.push(ci);
        trace.sql_servers[six].conversations.clear();
    }
    trace.sql_servers.retain(|s| !s.conversations.is_empty());
}

fn starts_with_ignore_case(payload: &[u8], prefix: &[u8]) -> bool {
    payload.len() >= prefix.len()
        && payload[..prefix.len()].eq_ignore_ascii_case(prefix)
}
