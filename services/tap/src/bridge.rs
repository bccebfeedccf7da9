//! Ethernet frame assembly between the overlay and the stack.
//!
//! Overlay ingress arrives as (src, dst, ethertype, payload) and is
//! synthesized into a wire-format frame for the stack; stack egress is split
//! back into those pieces for the overlay handler.

use netcon_stack::Mac;

/// Destination + source + ethertype.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Overlay egress hook: `(nwid, src, dst, ethertype, vlan_id, payload)`.
///
/// Invoked on whichever thread holds the stack lock; it must not block.
pub type FrameHandler = Box<dyn FnMut(u64, Mac, Mac, u16, u16, &[u8]) + Send>;

/// Build a wire-format Ethernet frame.
pub fn assemble_frame(src: Mac, dst: Mac, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a wire-format frame into `(dst, src, ethertype, payload)`.
/// Runt frames yield `None`.
pub fn parse_frame(frame: &[u8]) -> Option<(Mac, Mac, u16, &[u8])> {
    if frame.len() < ETHERNET_HEADER_LEN {
        return None;
    }
    let dst = Mac::from_slice(&frame[0..6])?;
    let src = Mac::from_slice(&frame[6..12])?;
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Some((dst, src, ethertype, &frame[ETHERNET_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let src = Mac([1, 2, 3, 4, 5, 6]);
        let dst = Mac([7, 8, 9, 10, 11, 12]);
        let frame = assemble_frame(src, dst, 0x0800, b"ip");
        assert_eq!(&frame[0..6], &dst.0);
        assert_eq!(&frame[6..12], &src.0);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(&frame[14..], b"ip");
    }

    #[test]
    fn test_parse_recovers_fields() {
        let src = Mac([1, 2, 3, 4, 5, 6]);
        let dst = Mac([7, 8, 9, 10, 11, 12]);
        let frame = assemble_frame(src, dst, 0x86dd, b"payload");
        let (pdst, psrc, ethertype, payload) = parse_frame(&frame).unwrap();
        assert_eq!((pdst, psrc, ethertype, payload), (dst, src, 0x86dd, &b"payload"[..]));
    }

    #[test]
    fn test_runt_frame_rejected() {
        assert!(parse_frame(&[0u8; 13]).is_none());
        assert!(parse_frame(&[0u8; 14]).is_some());
    }
}
