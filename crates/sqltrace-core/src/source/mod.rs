//! Capture-file frame sources.
//!
//! Every supported container normalizes to the same record shape so the
//! decoder never cares where a frame came from. File type is detected by
//! magic number regardless of extension; only ETW trace files, which have
//! no magic, are matched by extension (and reported as unsupported).

mod netmon;
mod pcap;

pub use netmon::NetMonSource;
pub use pcap::PcapSource;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

/// One captured frame as delivered by a source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// 1-based sequence number within the file.
    pub frame_no: u32,
    /// Capture timestamp, 100 ns ticks since the Unix epoch.
    pub ticks: u64,
    /// Length on the wire.
    pub frame_length: u32,
    /// Bytes present in the capture.
    pub captured_length: u32,
    /// Link-layer type tag.
    pub link_type: u16,
    pub data: Vec<u8>,
}

/// Pull-based frame iterator; `Ok(None)` signals end of stream.
pub trait CaptureSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError>;
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("capture format error: {0}")]
    Format(String),
    #[error("unsupported capture source: {0}")]
    Unsupported(String),
}

const MAGIC_NETMON: u32 = 0x5542_4D47;
const MAGIC_PCAPNG: u32 = 0x0A0D_0D0A;
const MAGIC_PCAP_US: u32 = 0xA1B2_C3D4;
const MAGIC_PCAP_US_SWAPPED: u32 = 0xD4C3_B2A1;
const MAGIC_PCAP_NS: u32 = 0xA1B2_3C4D;
const MAGIC_PCAP_NS_SWAPPED: u32 = 0x4D3C_B2A1;

/// Open a capture file, selecting the reader by magic number. ETW trace
/// files carry no magic and are matched by extension.
pub fn open_capture(path: &Path) -> Result<Box<dyn CaptureSource>, SourceError> {
    if path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("etl"))
    {
        return Err(SourceError::Unsupported(
            "ETW trace files (.etl) are not supported by this build".to_string(),
        ));
    }

    let mut file = File::open(path)?;
    let mut magic_bytes = [0u8; 4];
    file.read_exact(&mut magic_bytes)?;
    file.seek(SeekFrom::Start(0))?;
    let magic = u32::from_le_bytes(magic_bytes);

    match magic {
        MAGIC_NETMON => Ok(Box::new(NetMonSource::open(file)?)),
        MAGIC_PCAPNG
        | MAGIC_PCAP_US
        | MAGIC_PCAP_US_SWAPPED
        | MAGIC_PCAP_NS
        | MAGIC_PCAP_NS_SWAPPED => Ok(Box::new(PcapSource::open(file)?)),
        other => Err(SourceError::Format(format!(
            "magic number {other:08X} does not match a supported capture format"
        ))),
    }
}

/// Timestamp of a file's first frame, used to order multi-file batches
/// before the main parse. Zero when the file holds no frames.
pub fn peek_initial_tick(path: &Path) -> Result<u64, SourceError> {
    let mut source = open_capture(path)?;
    Ok(source.next_frame()?.map(|f| f.ticks).unwrap_or(0))
}
