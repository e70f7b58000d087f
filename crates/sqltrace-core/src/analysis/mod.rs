//! Analysis pipeline: file ordering, decode, the TCP passes, TDS
//! reconstruction, and report assembly.
//!
//! The core is single-threaded and batch-oriented: frames are drained from
//! each source in arrival order, and the whole-trace passes run once after
//! every file has been decoded, in a fixed order. A failure to open or
//! read one file is recorded as structural corruption and the remaining
//! files still process; only an empty input set is an error.

mod tcp;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::decode;
use crate::diag::{DiagKind, Diagnostics};
use crate::model::{AnalysisOptions, FileData, NetworkTrace};
use crate::report::{Report, build_report};
use crate::source::{self, CaptureSource, SourceError};
use crate::tds;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no input files matched")]
    NoInputs,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Finished result of one run.
pub struct AnalysisOutput {
    pub trace: NetworkTrace,
    pub report: Report,
    pub diagnostics: Diagnostics,
}

/// One analysis run: ingest sources, then finish.
pub struct Pipeline {
    trace: NetworkTrace,
    diag: Diagnostics,
    opts: AnalysisOptions,
}

impl Pipeline {
    pub fn new(opts: AnalysisOptions) -> Self {
        Self {
            trace: NetworkTrace::new(),
            diag: Diagnostics::new(),
            opts,
        }
    }

    /// Drain one frame source into the trace.
    pub fn ingest_source<S: CaptureSource>(&mut self, name: &str, size: u64, mut source: S) {
        let file_ix = self.trace.files.len();
        self.trace.files.push(FileData::new(name, size));

        loop {
            match source.next_frame() {
                Ok(Some(raw)) => {
                    {
                        let file = &mut self.trace.files[file_ix];
                        if file.start_ticks == 0 {
                            file.start_ticks = raw.ticks;
                        }
                        if raw.ticks > file.end_ticks {
                            file.end_ticks = raw.ticks;
                        }
                        file.frame_count += 1;
                    }
                    decode::decode_frame(&mut self.trace, &mut self.diag, &self.opts, file_ix, &raw);
                }
                Ok(None) => break,
                Err(err) => {
                    // mid-file corruption: keep what decoded, move on
                    self.diag.record_at(
                        DiagKind::StructuralCorruption,
                        err.to_string(),
                        Some(name.to_string()),
                        None,
                    );
                    break;
                }
            }
        }
    }

    /// Open and drain one capture file; open failures are diagnostics, not
    /// errors, so the rest of the batch still processes.
    pub fn ingest_path(&mut self, path: &Path) {
        let name = path.display().to_string();
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        match source::open_capture(path) {
            Ok(source) => self.ingest_boxed(&name, size, source),
            Err(err) => {
                let kind = match err {
                    SourceError::Unsupported(_) => DiagKind::UnknownProtocol,
                    _ => DiagKind::StructuralCorruption,
                };
                self.diag.record_at(kind, err.to_string(), Some(name), None);
            }
        }
    }

    fn ingest_boxed(&mut self, name: &str, size: u64, source: Box<dyn CaptureSource>) {
        self.ingest_source(name, size, source);
    }

    /// Run the whole-trace passes and build the report. Pass order matters:
    /// each depends on the one before it.
    pub fn finish(mut self) -> AnalysisOutput {
        tcp::normalize_directions(&mut self.trace);
        tcp::find_retransmits(&mut self.trace, &self.opts);
        tcp::find_keep_alive_retransmits(&mut self.trace, &self.opts);
        tcp::find_continuations(&mut self.trace, &self.opts);

        tds::process_tds(&mut self.trace, &self.opts, &mut self.diag);
        tds::adopt_stray_conversations(&mut self.trace);
        tds::merge_stray_servers(&mut self.trace);

        let report = build_report(&self.trace, &self.diag);
        AnalysisOutput {
            trace: self.trace,
            report,
            diagnostics: self.diag,
        }
    }
}

impl CaptureSource for Box<dyn CaptureSource> {
    fn next_frame(&mut self) -> Result<Option<crate::source::RawFrame>, SourceError> {
        (**self).next_frame()
    }
}

/// Analyze a batch of capture files, ordered by each file's first frame
/// timestamp so multi-file captures replay in wall-clock order.
pub fn analyze_files(
    paths: &[PathBuf],
    opts: &AnalysisOptions,
) -> Result<AnalysisOutput, AnalysisError> {
    if paths.is_empty() {
        return Err(AnalysisError::NoInputs);
    }

    let mut ordered: Vec<(u64, &PathBuf)> = paths
        .iter()
        .map(|p| (source::peek_initial_tick(p).unwrap_or(0), p))
        .collect();
    ordered.sort_by_key(|(tick, _)| *tick);

    let mut pipeline = Pipeline::new(opts.clone());
    for (_, path) in ordered {
        pipeline.ingest_path(path);
    }
    Ok(pipeline.finish())
}
