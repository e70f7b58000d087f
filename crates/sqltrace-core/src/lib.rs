//! sqltrace core library: offline reconstruction of SQL Server (TDS)
//! session establishment from network captures.
//!
//! The pipeline is a single batch pass: capture sources yield raw frames,
//! the decoder chain unwraps nested encapsulations down to TCP/UDP payload
//! and groups frames into conversations, the whole-trace TCP passes mark
//! retransmits/keep-alives/continuations, and the TDS reconstructor
//! replays each conversation's login sequence to judge whether it
//! succeeded, failed, or timed out. Parsing is byte-oriented over
//! untrusted input: every read is bounds-checked and a fault is contained
//! to the frame it occurred in.
//!
//! # Examples
//! ```no_run
//! use std::path::PathBuf;
//!
//! use sqltrace_core::{AnalysisOptions, analyze_files};
//!
//! let paths = vec![PathBuf::from("capture.pcap")];
//! let output = analyze_files(&paths, &AnalysisOptions::default())?;
//! println!("{} SQL conversations", output.report.totals.sql_conversations);
//! # Ok::<(), sqltrace_core::AnalysisError>(())
//! ```

mod analysis;
mod bytes;
mod decode;
mod diag;
mod model;
mod report;
mod source;
mod tds;
mod tls;

pub use analysis::{AnalysisError, AnalysisOutput, Pipeline, analyze_files};
pub use bytes::{Reader, Truncated};
pub use diag::{DiagEvent, DiagKind, Diagnostics};
pub use model::{
    AnalysisOptions, ConvId, Conversation, EndpointKey, FileData, Frame, FrameId, FrameType,
    NetworkTrace, SqlServer, TICKS_PER_SECOND, tcp_flags,
};
pub use report::{
    ConversationSummary, ErrorSummary, InputInfo, Milestones, REPORT_VERSION, Report,
    SqlServerSummary, ToolInfo, Totals, build_report, format_endpoint,
    friendly_tds_version_client, friendly_tds_version_server, ticks_to_rfc3339,
};
pub use source::{CaptureSource, NetMonSource, PcapSource, RawFrame, SourceError, open_capture,
    peek_initial_tick};
pub use tls::{Handshake, HandshakeKind, Hello, TlsRecord, parse as parse_tls};
