//! Run-scoped diagnostic stream.
//!
//! Captures routinely contain traffic and corruption outside this tool's
//! concern; those observations go to a diagnostic stream separate from the
//! primary report. The collector is owned by the pipeline for exactly one
//! run, so parallel analyses never share writer state. Events are mirrored
//! to the `log` facade at debug level for interactive troubleshooting.

use serde::Serialize;

/// Category of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagKind {
    /// Bad magic number, empty frame table, unreadable file.
    StructuralCorruption,
    /// Out-of-bounds read contained to a single frame.
    Truncation,
    /// Protocol or token outside this tool's concern.
    UnknownProtocol,
    /// Heuristic resolved by a documented tie-break.
    Ambiguity,
}

/// One diagnostic event with optional frame context.
#[derive(Debug, Clone, Serialize)]
pub struct DiagEvent {
    pub kind: DiagKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_no: Option<u32>,
}

/// Collector for one analysis run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    events: Vec<DiagEvent>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: DiagKind, message: impl Into<String>) {
        self.record_at(kind, message, None, None);
    }

    pub fn record_at(
        &mut self,
        kind: DiagKind,
        message: impl Into<String>,
        file: Option<String>,
        frame_no: Option<u32>,
    ) {
        let message = message.into();
        match frame_no {
            Some(no) => log::debug!("{:?}: {} (frame {})", kind, message, no),
            None => log::debug!("{:?}: {}", kind, message),
        }
        self.events.push(DiagEvent {
            kind,
            message,
            file,
            frame_no,
        });
    }

    pub fn events(&self) -> &[DiagEvent] {
        &self.events
    }

    pub fn count_of(&self, kind: DiagKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    /// Render the stream as lines suitable for a diagnostics file.
    pub fn render_lines(&self) -> Vec<String> {
        self.events
            .iter()
            .map(|e| {
                let ctx = match (&e.file, e.frame_no) {
                    (Some(f), Some(n)) => format!(" [{f} frame {n}]"),
                    (Some(f), None) => format!(" [{f}]"),
                    (None, Some(n)) => format!(" [frame {n}]"),
                    (None, None) => String::new(),
                };
                format!("{:?}: {}{}", e.kind, e.message, ctx)
            })
            .collect()
    }
}
