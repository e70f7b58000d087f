//! NetMon 2.x capture reader.
//!
//! The container has no ecosystem crate: a fixed header carrying a
//! SYSTEMTIME capture start and a frame-table offset/length, a table of
//! u32 frame offsets, and per-frame headers of {ticks-lo, ticks-hi
//! (microseconds since capture start), frame length, bytes available}.
//! The per-frame link type lives in the gap between the end of the frame
//! data and the next frame's table offset: 0 bytes means the file-level
//! network type, 1 or 2 bytes an explicit value. Files in the wild are not
//! consistent about this, hence the gap probing.

use std::io::{Read, Seek, SeekFrom};

use time::{Date, Month, PrimitiveDateTime, Time};

use super::{CaptureSource, RawFrame, SourceError};

const MAX_FRAME_SIZE: u32 = 0x0010_0000;

#[derive(Debug)]
pub struct NetMonSource<R: Read + Seek> {
    reader: R,
    network_type: u16,
    start_ticks: u64,
    frame_table_offset: u32,
    frame_table: Vec<u32>,
    next_frame: usize,
}

impl<R: Read + Seek> NetMonSource<R> {
    /// Reads the file header and frame table; the stream may be at any
    /// position.
    pub fn open(mut reader: R) -> Result<Self, SourceError> {
        reader.seek(SeekFrom::Start(0))?;
        let magic = read_u32(&mut reader)?;
        if magic != super::MAGIC_NETMON {
            return Err(SourceError::Format(format!(
                "magic number {magic:08X} is not a NetMon 2.x capture"
            )));
        }
        let _minor = read_u8(&mut reader)?;
        let major = read_u8(&mut reader)?;
        if major != 2 {
            return Err(SourceError::Format(format!(
                "NetMon major version {major} is not supported"
            )));
        }
        let network_type = read_u16(&mut reader)?;
        let start_ticks = read_capture_time(&mut reader)?;

        let frame_table_offset = read_u32(&mut reader)?;
        let frame_table_length = read_u32(&mut reader)?;
        // user data, comment data, statistics, network info offsets/lengths
        for _ in 0..8 {
            read_u32(&mut reader)?;
        }

        if frame_table_length == 0 {
            return Err(SourceError::Format(
                "zero-length frame table, file is not a valid capture".to_string(),
            ));
        }

        reader.seek(SeekFrom::Start(u64::from(frame_table_offset)))?;
        let mut frame_table = Vec::with_capacity(frame_table_length as usize / 4);
        for _ in 0..frame_table_length / 4 {
            frame_table.push(read_u32(&mut reader)?);
        }

        Ok(Self {
            reader,
            network_type,
            start_ticks,
            frame_table_offset,
            frame_table,
            next_frame: 0,
        })
    }
}

impl<R: Read + Seek> CaptureSource for NetMonSource<R> {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.next_frame >= self.frame_table.len() {
            return Ok(None);
        }
        let index = self.next_frame;
        self.next_frame += 1;
        let frame_no = (index + 1) as u32;

        self.reader
            .seek(SeekFrom::Start(u64::from(self.frame_table[index])))?;
        let ticks_lo = read_u32(&mut self.reader)?;
        let ticks_hi = read_u32(&mut self.reader)?;
        let micros = (u64::from(ticks_hi) << 32) | u64::from(ticks_lo);
        let ticks = self.start_ticks + micros * 10;
        let frame_length = read_u32(&mut self.reader)?;
        let bytes_available = read_u32(&mut self.reader)?;

        if bytes_available > MAX_FRAME_SIZE {
            log::debug!("NetMon frame {frame_no} exceeds the frame size cap, returning empty");
            return Ok(Some(RawFrame {
                frame_no,
                ticks,
                frame_length,
                captured_length: 0,
                link_type: self.network_type,
                data: Vec::new(),
            }));
        }

        let mut data = vec![0u8; bytes_available as usize];
        self.reader.read_exact(&mut data)?;

        // link type from the gap to the next frame's offset
        let position = self.reader.stream_position()?;
        let next_offset = self
            .frame_table
            .get(index + 1)
            .copied()
            .unwrap_or(self.frame_table_offset); // last frame ends at the table
        let gap = i64::from(next_offset) - position as i64;
        let link_type = match gap {
            0 => self.network_type,
            1 => u16::from(read_u8(&mut self.reader)?),
            2 => read_u16(&mut self.reader)?,
            more if more > 2 => {
                log::debug!(
                    "NetMon frame {frame_no}: link type gap of {more} bytes, reading first two"
                );
                read_u16(&mut self.reader)?
            }
            _ => self.network_type,
        };

        Ok(Some(RawFrame {
            frame_no,
            ticks,
            frame_length,
            captured_length: bytes_available,
            link_type,
            data,
        }))
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, SourceError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16, SourceError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, SourceError> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// SYSTEMTIME (eight u16 fields) to 100 ns ticks since the Unix epoch.
/// Converted traces sometimes carry junk milliseconds; those are zeroed.
fn read_capture_time<R: Read>(r: &mut R) -> Result<u64, SourceError> {
    let year = read_u16(r)?;
    let month = read_u16(r)?;
    let _day_of_week = read_u16(r)?;
    let day = read_u16(r)?;
    let hour = read_u16(r)?;
    let minute = read_u16(r)?;
    let second = read_u16(r)?;
    let mut millis = read_u16(r)?;
    if millis > 999 {
        millis = 0;
    }

    let month = Month::try_from(month.clamp(1, 12) as u8)
        .map_err(|e| SourceError::Format(format!("capture time month: {e}")))?;
    let date = Date::from_calendar_date(i32::from(year), month, day.clamp(1, 31) as u8)
        .map_err(|e| SourceError::Format(format!("capture time date: {e}")))?;
    let time = Time::from_hms_milli(
        hour.min(23) as u8,
        minute.min(59) as u8,
        second.min(59) as u8,
        millis,
    )
    .map_err(|e| SourceError::Format(format!("capture time: {e}")))?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    let nanos = datetime.unix_timestamp_nanos();
    Ok((nanos / 100).max(0) as u64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a minimal NetMon 2.x capture holding the given frames as
    /// (micros-since-start, link-gap-bytes, data).
    pub(crate) fn netmon_bytes(frames: &[(u64, Option<u16>, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&super::super::MAGIC_NETMON.to_le_bytes());
        out.push(0); // minor
        out.push(2); // major
        out.extend_from_slice(&1u16.to_le_bytes()); // network type: ethernet
        // capture start: 2024-05-01 12:00:00.000 UTC (Wednesday)
        for v in [2024u16, 5, 3, 1, 12, 0, 0, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let header_rest = out.len();
        out.extend_from_slice(&[0u8; 40]); // table offset/length + 8 more u32s

        let mut offsets = Vec::new();
        for (micros, link, data) in frames {
            offsets.push(out.len() as u32);
            out.extend_from_slice(&((*micros & 0xFFFF_FFFF) as u32).to_le_bytes());
            out.extend_from_slice(&((*micros >> 32) as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
            if let Some(link) = link {
                out.extend_from_slice(&link.to_le_bytes());
            }
        }

        let table_offset = out.len() as u32;
        for offset in &offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        let table_len = (offsets.len() * 4) as u32;
        out[header_rest..header_rest + 4].copy_from_slice(&table_offset.to_le_bytes());
        out[header_rest + 4..header_rest + 8].copy_from_slice(&table_len.to_le_bytes());
        out
    }

    #[test]
    fn frames_read_with_gap_encoded_link_types() {
        let bytes = netmon_bytes(&[
            (0, None, vec![1, 2, 3]),           // gap 0: default link type
            (1_000_000, Some(0x0071), vec![9]), // gap 2: explicit cooked
        ]);
        let mut source = NetMonSource::open(Cursor::new(bytes)).unwrap();

        let f1 = source.next_frame().unwrap().unwrap();
        assert_eq!(f1.frame_no, 1);
        assert_eq!(f1.link_type, 1);
        assert_eq!(f1.data, vec![1, 2, 3]);

        let f2 = source.next_frame().unwrap().unwrap();
        assert_eq!(f2.link_type, 0x0071);
        // one second after the first frame
        assert_eq!(f2.ticks - f1.ticks, 10_000_000);

        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn zero_length_frame_table_is_structural_corruption() {
        let mut bytes = netmon_bytes(&[(0, None, vec![1])]);
        // stamp the frame table length to zero
        let header_rest = 4 + 2 + 2 + 16 + 4;
        bytes[header_rest..header_rest + 4].copy_from_slice(&0u32.to_le_bytes());
        let err = NetMonSource::open(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SourceError::Format(_)));
    }
}
