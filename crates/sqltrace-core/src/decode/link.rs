//! Link-layer decoders: Ethernet, 802.11 data frames (NetMon metadata
//! framing), Linux cooked capture, and raw IP.

use super::{Decoder, NextProtocol};
use crate::bytes::{Reader, Truncated};
use crate::model::Frame;

impl Decoder<'_> {
    pub(super) fn ethernet(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut r = Reader::at(data, offset);
        self.dest_mac = r.read_u48_be()?;
        self.source_mac = r.read_u48_be()?;
        let ether_type = r.read_u16_be()?;
        self.dispatch(data, r.pos(), NextProtocol::Ether(ether_type), frame)
    }

    /// 802.1Q shim; more than one may be stacked.
    pub(super) fn vlan(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut r = Reader::at(data, offset);
        r.skip(2)?; // priority/DEI/VLAN id
        let ether_type = r.read_u16_be()?;
        self.dispatch(data, r.pos(), NextProtocol::Ether(ether_type), frame)
    }

    /// 802.1BR VNTag shim: four tag bytes, then the real EtherType.
    pub(super) fn vntag(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut r = Reader::at(data, offset);
        r.skip(4)?;
        let ether_type = r.read_u16_be()?;
        self.dispatch(data, r.pos(), NextProtocol::Ether(ether_type), frame)
    }

    pub(super) fn linux_cooked(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let mut r = Reader::at(data, offset);
        let packet_type = r.read_u16_be()?;
        if packet_type != 0 && packet_type != 4 {
            return Ok(()); // only incoming/outgoing unicast
        }
        let address_type = r.read_u16_be()?;
        if address_type > 1 {
            return Ok(()); // not an Ethernet-style address
        }
        let address_length = r.read_u16_be()?;
        if address_length == 6 {
            let mac = r.read_u48_be()?;
            if packet_type == 0 {
                self.source_mac = mac;
            } else {
                self.dest_mac = mac;
            }
            r.skip(2)?; // address field is padded to 8 bytes
        } else {
            r.skip(8)?;
        }
        let ether_type = r.read_u16_be()?;
        self.dispatch(data, r.pos(), NextProtocol::Ether(ether_type), frame)
    }

    pub(super) fn raw_ip(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let version = crate::bytes::u8_at(data, offset)? >> 4;
        match version {
            4 => self.ipv4(data, offset, frame),
            6 => self.ipv6(data, offset, frame),
            _ => Ok(()),
        }
    }

    /// 802.11 as captured by NetMon: a metadata header, then frame control.
    /// Only data frames are decoded; control, null, and reserved subtypes
    /// are skipped.
    pub(super) fn wifi(
        &mut self,
        data: &[u8],
        offset: usize,
        frame: &mut Frame,
    ) -> Result<(), Truncated> {
        let version = crate::bytes::u8_at(data, offset)?;
        if version != 2 {
            self.note_unknown(format!("wifi metadata version {version}"), frame);
            return Ok(());
        }
        let metadata_length = crate::bytes::u16_le_at(data, offset + 1)? as usize;
        let mut pos = offset + metadata_length;

        let fc0 = crate::bytes::u8_at(data, pos)?;
        let frame_type = (fc0 >> 2) & 0x03;
        if frame_type != 2 {
            return Ok(()); // not a data frame
        }
        let sub_type = fc0 >> 4;
        if sub_type & 0x04 != 0 {
            return Ok(()); // null subtype carries no data
        }
        let fc1 = crate::bytes::u8_at(data, pos + 1)?;
        let ds_type = fc1 & 0x03;
        let ordered = fc1 >> 7;
        pos += 2; // frame control
        pos += 2; // duration

        // MAC address positions depend on the DS bits.
        match ds_type {
            0 => {
                let mut r = Reader::at(data, pos);
                self.dest_mac = r.read_u48_be()?;
                self.source_mac = r.read_u48_be()?;
                pos += 20;
            }
            1 => {
                let mut r = Reader::at(data, pos + 6);
                self.source_mac = r.read_u48_be()?;
                self.dest_mac = r.read_u48_be()?;
                pos += 20;
            }
            2 => {
                let mut r = Reader::at(data, pos);
                self.dest_mac = r.read_u48_be()?;
                r.skip(6)?;
                self.source_mac = r.read_u48_be()?;
                pos += 20;
            }
            _ => {
                let mut r = Reader::at(data, pos + 12);
                self.dest_mac = r.read_u48_be()?;
                r.skip(2)?; // sequence control sits between dest and source
                self.source_mac = r.read_u48_be()?;
                pos += 26;
            }
        }

        if sub_type & 0x08 != 0 {
            pos += 2; // QoS control
            if ordered != 0 {
                pos += 4; // HT control
            }
        }

        // LLC: DSAP, SSAP, control (1 or 2 bytes), then SNAP.
        pos += 2;
        let control = crate::bytes::u8_at(data, pos)?;
        pos += if control & 0x03 == 0x03 { 1 } else { 2 };
        pos += 3; // SNAP organization code
        let ether_type = crate::bytes::u16_be_at(data, pos)?;
        pos += 2;

        self.dispatch(data, pos, NextProtocol::Ether(ether_type), frame)
    }
}
