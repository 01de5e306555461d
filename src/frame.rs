//! CAN frame value type and identifier filtering.

use core::fmt;

use embedded_can::{ExtendedId, Id, StandardId};

/// A single CAN 2.0 data frame.
///
/// Immutable once built. The payload lives in a fixed 8 byte buffer with a
/// separate length, so frames are `Copy`-cheap to clone and queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    id: Id,
    data: [u8; 8],
    dlc: u8,
    /// Microseconds since a transport-defined epoch, 0 when unknown
    timestamp: u64,
}

impl Frame {
    /// Build a frame with a standard (11-bit) identifier.
    ///
    /// Returns None if the id is out of range or the payload exceeds 8 bytes.
    pub fn new_std(id_raw: u16, data: &[u8]) -> Option<Self> {
        let id = StandardId::new(id_raw)?;
        <Self as embedded_can::Frame>::new(id, data)
    }

    /// Build a frame with an extended (29-bit) identifier.
    pub fn new_ext(id_raw: u32, data: &[u8]) -> Option<Self> {
        let id = ExtendedId::new(id_raw)?;
        <Self as embedded_can::Frame>::new(id, data)
    }

    /// Attach an ingest timestamp (microseconds). Used by transports when
    /// the hardware reports one.
    pub fn with_timestamp(mut self, micros: u64) -> Self {
        self.timestamp = micros;
        self
    }

    /// The identifier as a raw integer, 11 or 29 bits depending on
    /// [`Frame::is_extended`].
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(sid) => sid.as_raw().into(),
            Id::Extended(eid) => eid.as_raw(),
        }
    }

    /// Microseconds since the transport's epoch, 0 when unknown.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            dlc: data.len() as u8,
            timestamp: 0,
        })
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None // No remote frame support
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use embedded_can::Frame;
        write!(f, "{:#x},{} :", self.raw_id(), self.dlc)?;
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Mask/code identifier filter.
///
/// A frame matches when `(frame.id & mask) == (mask & code)` and the
/// extended flags agree.
#[derive(Clone, Copy, Debug)]
pub struct IdMaskFilter {
    pub mask: u32,
    pub code: u32,
    pub extended: bool,
}

impl IdMaskFilter {
    pub fn new(mask: u32, code: u32, extended: bool) -> Self {
        Self {
            mask,
            code,
            extended,
        }
    }

    /// Test whether the given frame passes this filter.
    pub fn matches(&self, frame: &Frame) -> bool {
        use embedded_can::Frame;
        if frame.is_extended() != self.extended {
            return false;
        }
        (frame.raw_id() & self.mask) == (self.mask & self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::Frame as _;
    use hex_literal::hex;

    #[test]
    fn dlc_tracks_payload() {
        let frame = Frame::new_ext(0x12345, &hex!("01 02 03")).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &hex!("01 02 03"));
        assert_eq!(frame.raw_id(), 0x12345);
        assert!(frame.is_extended());
    }

    #[test]
    fn empty_payload_is_legal() {
        let frame = Frame::new_std(0x7FF, &[]).unwrap();
        assert_eq!(frame.dlc(), 0);
        assert_eq!(frame.data(), &[] as &[u8]);
        assert!(!frame.is_extended());
    }

    #[test]
    fn oversize_payload_rejected() {
        assert!(Frame::new_std(0x100, &[0u8; 9]).is_none());
    }

    #[test]
    fn id_bounds_enforced() {
        assert!(Frame::new_std(0x800, &[]).is_none());
        assert!(Frame::new_ext(0x2000_0000, &[]).is_none());
        assert!(Frame::new_ext(0x1FFF_FFFF, &[]).is_some());
    }

    #[test]
    fn remote_frames_unsupported() {
        assert!(Frame::new_remote(StandardId::new(0x123).unwrap(), 4).is_none());
    }

    #[test]
    fn timestamp_defaults_to_unknown() {
        let frame = Frame::new_std(0x10, &[1]).unwrap();
        assert_eq!(frame.timestamp(), 0);
        assert_eq!(frame.with_timestamp(1234).timestamp(), 1234);
    }

    #[test]
    fn mask_filter_matching() {
        let filter = IdMaskFilter::new(0xFF00, 0x1200, true);
        assert!(filter.matches(&Frame::new_ext(0x1234, &[]).unwrap()));
        assert!(filter.matches(&Frame::new_ext(0x12FF, &[]).unwrap()));
        assert!(!filter.matches(&Frame::new_ext(0x1334, &[]).unwrap()));
        // Extended flag must agree even when the bits line up
        assert!(!filter.matches(&Frame::new_std(0x234, &[]).unwrap()));
    }

    #[test]
    fn display_formats_id_and_payload() {
        let frame = Frame::new_std(0x123, &hex!("AB CD")).unwrap();
        assert_eq!(format!("{frame}"), "0x123,2 : AB CD");
    }
}
