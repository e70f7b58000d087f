//! Legacy PCAP and PCAPNG sources built on `pcap-parser`.
//!
//! Legacy files carry one global link type and a magic number that fixes
//! byte order and timestamp resolution. PCAPNG files carry per-interface
//! link types and a per-interface timestamp resolution option
//! (`if_tsresol`), honored here in both its power-of-10 and power-of-2
//! forms.

use std::io::Read;

use pcap_parser::{
    Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader,
    traits::PcapReaderIterator,
};

use super::{CaptureSource, RawFrame, SourceError};

const BUFFER_SIZE: usize = 64 * 1024;
const NANOSECOND_MAGIC: u32 = 0xA1B2_3C4D;
const NANOSECOND_MAGIC_SWAPPED: u32 = 0x4D3C_B2A1;

/// Ticks from the Unix epoch for a whole-second count.
const TICKS_PER_SECOND: u64 = 10_000_000;

pub struct PcapSource<R: Read> {
    inner: Inner<R>,
    frame_no: u32,
}

enum Inner<R: Read> {
    Legacy {
        reader: LegacyPcapReader<BufMagic<R>>,
        link_type: u16,
        nanosecond: bool,
    },
    Ng {
        reader: PcapNGReader<BufMagic<R>>,
        interfaces: Vec<Interface>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link_type: u16,
    ts_resol: u8,
    ts_offset: u64,
}

impl<R: Read> PcapSource<R> {
    /// `reader` must be positioned at the start of the file; the magic is
    /// peeked here (the PCAPNG section-header magic doubles as its block
    /// type) and replayed for the block parser.
    pub fn open(mut reader: R) -> Result<Self, SourceError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        let replay = BufMagic {
            magic,
            replayed: 0,
            inner: reader,
        };
        let inner = if magic == [0x0A, 0x0D, 0x0D, 0x0A] {
            let reader = PcapNGReader::new(BUFFER_SIZE, replay)
                .map_err(|e| SourceError::Format(e.to_string()))?;
            Inner::Ng {
                reader,
                interfaces: Vec::new(),
            }
        } else {
            let reader = LegacyPcapReader::new(BUFFER_SIZE, replay)
                .map_err(|e| SourceError::Format(e.to_string()))?;
            Inner::Legacy {
                reader,
                link_type: 1,
                nanosecond: false,
            }
        };
        Ok(Self { inner, frame_no: 0 })
    }
}

impl<R: Read> CaptureSource for PcapSource<R> {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        loop {
            match &mut self.inner {
                Inner::Legacy {
                    reader,
                    link_type,
                    nanosecond,
                } => match reader.next() {
                    Ok((offset, block)) => {
                        let frame = match block {
                            PcapBlockOwned::LegacyHeader(header) => {
                                *link_type = header.network.0 as u16;
                                *nanosecond = matches!(
                                    header.magic_number,
                                    NANOSECOND_MAGIC | NANOSECOND_MAGIC_SWAPPED
                                );
                                None
                            }
                            PcapBlockOwned::Legacy(packet) => {
                                let frac = if *nanosecond {
                                    u64::from(packet.ts_usec) / 100
                                } else {
                                    u64::from(packet.ts_usec) * 10
                                };
                                let ticks =
                                    u64::from(packet.ts_sec) * TICKS_PER_SECOND + frac;
                                self.frame_no += 1;
                                Some(RawFrame {
                                    frame_no: self.frame_no,
                                    ticks,
                                    frame_length: packet.origlen,
                                    captured_length: packet.caplen,
                                    link_type: *link_type,
                                    data: packet.data.to_vec(),
                                })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if frame.is_some() {
                            return Ok(frame);
                        }
                    }
                    Err(PcapError::Eof) => return Ok(None),
                    Err(PcapError::Incomplete(_)) => {
                        reader
                            .refill()
                            .map_err(|e| SourceError::Format(e.to_string()))?;
                    }
                    Err(e) => return Err(SourceError::Format(e.to_string())),
                },
                Inner::Ng { reader, interfaces } => match reader.next() {
                    Ok((offset, block)) => {
                        let frame = match block {
                            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                                interfaces.clear();
                                None
                            }
                            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                                interfaces.push(Interface {
                                    link_type: idb.linktype.0 as u16,
                                    ts_resol: idb.if_tsresol,
                                    ts_offset: idb.if_tsoffset as u64,
                                });
                                None
                            }
                            PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => {
                                let interface = interfaces
                                    .get(packet.if_id as usize)
                                    .copied()
                                    .unwrap_or(Interface {
                                        link_type: 1,
                                        ts_resol: 6,
                                        ts_offset: 0,
                                    });
                                let ts = (u64::from(packet.ts_high) << 32)
                                    | u64::from(packet.ts_low);
                                let ticks = units_to_ticks(ts, interface.ts_resol)
                                    + interface.ts_offset * TICKS_PER_SECOND;
                                self.frame_no += 1;
                                Some(RawFrame {
                                    frame_no: self.frame_no,
                                    ticks,
                                    frame_length: packet.origlen,
                                    captured_length: packet.caplen,
                                    link_type: interface.link_type,
                                    data: packet.data.to_vec(),
                                })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if frame.is_some() {
                            return Ok(frame);
                        }
                    }
                    Err(PcapError::Eof) => return Ok(None),
                    Err(PcapError::Incomplete(_)) => {
                        reader
                            .refill()
                            .map_err(|e| SourceError::Format(e.to_string()))?;
                    }
                    Err(e) => return Err(SourceError::Format(e.to_string())),
                },
            }
        }
    }
}

/// Convert a raw interface timestamp into 100 ns ticks. `ts_resol` encodes
/// units per second: a power of ten, or with the high bit set a power of
/// two.
fn units_to_ticks(ts: u64, ts_resol: u8) -> u64 {
    let units_per_second: u128 = if ts_resol & 0x80 == 0 {
        10u128.saturating_pow(u32::from(ts_resol))
    } else {
        1u128 << (ts_resol & 0x7F)
    };
    if units_per_second == 0 {
        return 0;
    }
    ((u128::from(ts) * u128::from(TICKS_PER_SECOND)) / units_per_second) as u64
}

/// Replays the peeked magic bytes ahead of the remaining stream.
struct BufMagic<R: Read> {
    magic: [u8; 4],
    replayed: usize,
    inner: R,
}

impl<R: Read> Read for BufMagic<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.replayed < 4 {
            let n = (4 - self.replayed).min(buf.len());
            buf[..n].copy_from_slice(&self.magic[self.replayed..self.replayed + n]);
            self.replayed += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}
