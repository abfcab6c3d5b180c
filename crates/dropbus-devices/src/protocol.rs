/*!
 * Wire format of announcement packets.
 *
 * An announcement is the data of a bus packet sent to address 0:
 *
 * ```text
 * serial_number: u32 LE
 * segment*:
 *     type: u8  size: u8  address: u8  flags: u8
 *     driver_class: u32 LE  error_code: u16 LE
 *     payload: [u8; size]
 * ```
 *
 * Segments are packed without padding. Framing, checksums and baud
 * negotiation belong to the transport.
 */
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use dropbus_core::config::{ANNOUNCEMENT_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use dropbus_core::types::{Address, DriverClass, SerialNumber};

use crate::device::{DeviceError, LinkRate, Result};

/// Longest panic name printed from a panic segment
pub const PANIC_NAME_LENGTH: usize = 8;

bitflags! {
    /// Flags carried by a driver info segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct InfoFlags: u8 {
        /// Announcer is looking for a pairing partner
        const PAIRING_MODE = 1 << 0;
        /// Announcer is paired
        const PAIRED = 1 << 1;
        /// Announcer may be paired
        const PAIRABLE = 1 << 2;
        /// Address is provisional
        const UNCERTAIN = 1 << 3;
        /// Receiver at this address must give it up
        const CONFLICT = 1 << 4;
    }
}

/// Kind of a driver info segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Regular announcement
    Normal,
    /// Announcement from a driver reporting an error code
    Error,
    /// Driver has panicked; payload holds its name
    Panic,
    /// A type this node does not understand
    Other(u8),
}

impl SegmentKind {
    fn as_byte(self) -> u8 {
        match self {
            SegmentKind::Normal => 1,
            SegmentKind::Error => 2,
            SegmentKind::Panic => 3,
            SegmentKind::Other(raw) => raw,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => SegmentKind::Normal,
            2 => SegmentKind::Error,
            3 => SegmentKind::Panic,
            raw => SegmentKind::Other(raw),
        }
    }
}

/// One driver info segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Segment kind
    pub kind: SegmentKind,
    /// Address the announcer holds or claims
    pub address: Address,
    /// Segment flags
    pub flags: InfoFlags,
    /// Driver class of the announcer
    pub driver_class: DriverClass,
    /// Driver error code, zero when healthy
    pub error_code: u16,
    /// Opaque driver payload
    pub payload: Bytes,
}

impl DriverInfo {
    /// A normal segment with no payload
    pub fn new(address: Address, driver_class: DriverClass, flags: InfoFlags) -> Self {
        Self {
            kind: SegmentKind::Normal,
            address,
            flags,
            driver_class,
            error_code: 0,
            payload: Bytes::new(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Bytes this segment takes on the wire
    pub fn encoded_len(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.payload.len()
    }

    /// The panic name carried by a panic segment
    pub fn panic_name(&self) -> String {
        let len = self.payload.len().min(PANIC_NAME_LENGTH);
        String::from_utf8_lossy(&self.payload[..len]).into_owned()
    }

    /// Append the encoded segment to `out`
    ///
    /// Payloads longer than 255 bytes are truncated to fit the size byte.
    pub fn encode(&self, out: &mut BytesMut) {
        let size = self.payload.len().min(u8::MAX as usize);
        out.reserve(SEGMENT_HEADER_SIZE + size);
        out.put_u8(self.kind.as_byte());
        out.put_u8(size as u8);
        out.put_u8(self.address.get());
        out.put_u8(self.flags.bits());
        out.put_u32_le(self.driver_class.get());
        out.put_u16_le(self.error_code);
        out.put_slice(&self.payload[..size]);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(DeviceError::Codec(format!(
                "truncated segment header: {} bytes left",
                buf.remaining()
            )));
        }

        let kind = SegmentKind::from_byte(buf.get_u8());
        let size = buf.get_u8() as usize;
        let address = Address::new(buf.get_u8());
        let flags = InfoFlags::from_bits_retain(buf.get_u8());
        let driver_class = DriverClass::new(buf.get_u32_le());
        let error_code = buf.get_u16_le();

        if buf.remaining() < size {
            return Err(DeviceError::Codec(format!(
                "segment declares {} payload bytes, {} left",
                size,
                buf.remaining()
            )));
        }

        Ok(Self {
            kind,
            address,
            flags,
            driver_class,
            error_code,
            payload: buf.split_to(size),
        })
    }
}

/// A complete announcement: sender serial plus segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementPacket {
    /// Serial number of the announcing node
    pub serial_number: SerialNumber,
    /// Driver info segments, in order
    pub segments: Vec<DriverInfo>,
}

impl AnnouncementPacket {
    /// Encode the announcement
    pub fn encode(&self) -> Bytes {
        let len = ANNOUNCEMENT_HEADER_SIZE
            + self.segments.iter().map(DriverInfo::encoded_len).sum::<usize>();
        let mut out = BytesMut::with_capacity(len);
        out.put_u32_le(self.serial_number.get());
        for segment in &self.segments {
            segment.encode(&mut out);
        }
        out.freeze()
    }

    /// Split announcement data into the sender serial and a lazy segment reader
    pub fn parse(mut data: Bytes) -> Result<(SerialNumber, Segments)> {
        if data.remaining() < ANNOUNCEMENT_HEADER_SIZE {
            return Err(DeviceError::Codec(format!(
                "announcement shorter than its header: {} bytes",
                data.remaining()
            )));
        }
        let serial = SerialNumber::new(data.get_u32_le());
        Ok((serial, Segments { buf: data }))
    }

    /// Decode an announcement, failing on the first malformed segment
    pub fn decode(data: Bytes) -> Result<Self> {
        let (serial_number, segments) = Self::parse(data)?;
        Ok(Self {
            serial_number,
            segments: segments.collect::<Result<Vec<_>>>()?,
        })
    }
}

/// Lazy reader over the segments of an announcement
///
/// Each item consumes exactly the segment's declared length. After a
/// malformed segment the reader yields the error once and then stops.
#[derive(Debug)]
pub struct Segments {
    buf: Bytes,
}

impl Iterator for Segments {
    type Item = Result<DriverInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.buf.has_remaining() {
            return None;
        }
        let item = DriverInfo::decode(&mut self.buf);
        if item.is_err() {
            self.buf.clear();
        }
        Some(item)
    }
}

/// Incrementally builds an outgoing announcement within a byte limit
#[derive(Debug)]
pub struct AnnouncementBuilder {
    buf: BytesMut,
    limit: usize,
    segments: usize,
}

impl AnnouncementBuilder {
    /// Start an announcement for `serial`, at most `limit` bytes long
    pub fn new(serial: SerialNumber, limit: usize) -> Self {
        let mut buf = BytesMut::with_capacity(limit);
        buf.put_u32_le(serial.get());
        Self {
            buf,
            limit,
            segments: 0,
        }
    }

    /// Bytes still available, segment headers included
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Whether a segment header still fits
    pub fn has_room(&self) -> bool {
        self.remaining() >= SEGMENT_HEADER_SIZE
    }

    /// Payload bytes a new segment may carry
    pub fn payload_budget(&self, max_segment_payload: usize) -> usize {
        self.remaining()
            .saturating_sub(SEGMENT_HEADER_SIZE)
            .min(max_segment_payload)
    }

    /// Append a segment; it is omitted if it does not fit
    pub fn push(&mut self, info: &DriverInfo) -> bool {
        if info.encoded_len() > self.remaining() {
            return false;
        }
        info.encode(&mut self.buf);
        self.segments += 1;
        true
    }

    /// Number of segments written
    pub fn segment_count(&self) -> usize {
        self.segments
    }

    /// Finish the announcement
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A packet as handed over by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPacket {
    /// Destination address; announcements go to address 0
    pub address: Address,
    /// Protocol version of the sender
    pub version: u8,
    /// Link rate the packet was sent at
    pub link_rate: LinkRate,
    /// Packet data
    pub data: Bytes,
}

impl BusPacket {
    /// An announcement packet
    pub fn announcement(version: u8, link_rate: LinkRate, data: Bytes) -> Self {
        Self {
            address: Address::UNASSIGNED,
            version,
            link_rate,
            data,
        }
    }
}

/// One inbound segment, as offered to a driver
#[derive(Debug, Clone, Copy)]
pub struct InboundSegment<'a> {
    /// Serial number of the announcing node
    pub serial_number: SerialNumber,
    /// Link rate of the packet that carried the segment
    pub link_rate: LinkRate,
    /// The segment itself
    pub info: &'a DriverInfo,
}
