//! Decoded protocol data units handed to the reassembly engines.
//!
//! Header parsing happens outside the engine; callers fill these in from whatever decoder they
//! use and pass the payload by reference. The engine copies what it buffers.

use crate::error::FlowError;

/// IPv4 "more fragments" flag in the flags/fragment-offset header word.
pub const IP_MF: u16 = 0x2000;
/// IPv4 "don't fragment" flag in the flags/fragment-offset header word.
pub const IP_DF: u16 = 0x4000;
/// Fragment offset mask in the flags/fragment-offset header word.
pub const IP_OFFMASK: u16 = 0x1fff;

/// IPv6 "more fragments" flag in the fragment header offset/flags word.
pub const IP6F_MORE_FRAG: u16 = 0x0001;
/// Fragment offset mask in the IPv6 fragment header offset/flags word.
pub const IP6F_OFF_MASK: u16 = 0xfff8;
/// Next header value of the IPv6 fragment extension header.
pub const IPPROTO_FRAGMENT: u8 = 44;

/// Fields shared by IPv4 and IPv6 fragments.
pub trait Fragment {
    /// Payload offset in bytes.
    fn byte_offset(&self) -> usize;

    /// `true` unless this is the final fragment.
    fn is_more_fragments(&self) -> bool;

    /// Fragment payload (IP headers excluded).
    fn data(&self) -> &[u8];

    /// Payload length in bytes.
    #[inline]
    fn length(&self) -> usize {
        self.data().len()
    }

    /// End of the payload (exclusive) in bytes.
    #[inline]
    fn end(&self) -> usize {
        self.byte_offset() + self.length()
    }
}

/// One IPv4 fragment.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Fragment<'a> {
    /// Fragment offset in 8-byte units, as carried on the wire.
    pub offset: u16,
    /// `true` unless this is the final fragment.
    pub more_fragments: bool,
    /// Fragment payload (IP header excluded).
    pub payload: &'a [u8],
}

impl<'a> Ipv4Fragment<'a> {
    pub fn new(offset: u16, more_fragments: bool, payload: &'a [u8]) -> Self {
        Ipv4Fragment {
            offset,
            more_fragments,
            payload,
        }
    }

    /// Decodes the 16-bit flags/fragment-offset header word.
    ///
    /// Fails with [FlowError::InvalidArgument] if the datagram is not a fragment.
    pub fn from_header_field(flags_offset: u16, payload: &'a [u8]) -> Result<Self, FlowError> {
        if !is_fragment(flags_offset) {
            return Err(FlowError::InvalidArgument);
        }
        Ok(Ipv4Fragment {
            offset: flags_offset & IP_OFFMASK,
            more_fragments: flags_offset & IP_MF != 0,
            payload,
        })
    }
}

impl<'a> Fragment for Ipv4Fragment<'a> {
    #[inline]
    fn byte_offset(&self) -> usize {
        self.offset as usize * 8
    }

    #[inline]
    fn is_more_fragments(&self) -> bool {
        self.more_fragments
    }

    #[inline]
    fn data(&self) -> &[u8] {
        self.payload
    }
}

/// Returns `true` if a datagram with this flags/fragment-offset word is part of a fragmented
/// datagram.
pub fn is_fragment(flags_offset: u16) -> bool {
    (flags_offset & IP_OFFMASK != 0 || flags_offset & IP_MF != 0) && flags_offset & IP_DF == 0
}

/// One IPv6 fragment, taken from a packet carrying a fragment extension header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Fragment<'a> {
    /// Fragment offset in 8-byte units.
    pub offset: u16,
    /// `true` unless this is the final fragment.
    pub more_fragments: bool,
    /// Fragmentable part of the original packet carried by this fragment.
    pub payload: &'a [u8],
}

impl<'a> Ipv6Fragment<'a> {
    pub fn new(offset: u16, more_fragments: bool, payload: &'a [u8]) -> Self {
        Ipv6Fragment {
            offset,
            more_fragments,
            payload,
        }
    }

    /// Decodes the 16-bit offset/flags word of the fragment header.
    ///
    /// Fails with [FlowError::InvalidArgument] for an atomic fragment (offset 0 and no more
    /// fragments), which is not part of a fragmented packet.
    pub fn from_header_field(offset_flags: u16, payload: &'a [u8]) -> Result<Self, FlowError> {
        let offset = (offset_flags & IP6F_OFF_MASK) >> 3;
        let more_fragments = offset_flags & IP6F_MORE_FRAG != 0;
        if offset == 0 && !more_fragments {
            return Err(FlowError::InvalidArgument);
        }
        Ok(Ipv6Fragment {
            offset,
            more_fragments,
            payload,
        })
    }
}

impl<'a> Fragment for Ipv6Fragment<'a> {
    #[inline]
    fn byte_offset(&self) -> usize {
        self.offset as usize * 8
    }

    #[inline]
    fn is_more_fragments(&self) -> bool {
        self.more_fragments
    }

    #[inline]
    fn data(&self) -> &[u8] {
        self.payload
    }
}

/// One TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    /// Raw sequence number.
    pub seq_no: u32,
    /// TCP flags.
    pub flags: u8,
    /// Segment payload (TCP header excluded).
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn new(seq_no: u32, flags: u8, payload: &'a [u8]) -> Self {
        TcpSegment {
            seq_no,
            flags,
            payload,
        }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_fragment_header_field() {
        let frag = Ipv4Fragment::from_header_field(IP_MF | 185, b"data").unwrap();
        assert!(frag.more_fragments);
        assert_eq!(frag.offset, 185);
        assert_eq!(frag.byte_offset(), 1480);
        assert_eq!(frag.end(), 1484);

        let last = Ipv4Fragment::from_header_field(370, b"xy").unwrap();
        assert!(!last.is_more_fragments());
    }

    #[test]
    fn core_fragment_not_fragment() {
        assert!(!is_fragment(0));
        assert!(!is_fragment(IP_DF));
        assert!(!is_fragment(IP_DF | IP_MF));
        assert!(is_fragment(IP_MF));
        assert!(matches!(
            Ipv4Fragment::from_header_field(IP_DF, b"x"),
            Err(FlowError::InvalidArgument)
        ));
    }

    #[test]
    fn core_ipv6_fragment_header_field() {
        // offset 1448 bytes (181 units), more fragments
        let frag = Ipv6Fragment::from_header_field(181 << 3 | IP6F_MORE_FRAG, b"data").unwrap();
        assert_eq!(frag.offset, 181);
        assert!(frag.is_more_fragments());
        assert_eq!(frag.byte_offset(), 1448);
        assert_eq!(frag.end(), 1452);

        // reserved bits are ignored
        let last = Ipv6Fragment::from_header_field(181 << 3 | 0b110, b"xy").unwrap();
        assert!(!last.more_fragments);

        assert!(matches!(
            Ipv6Fragment::from_header_field(0, b"atomic"),
            Err(FlowError::InvalidArgument)
        ));
    }
}
