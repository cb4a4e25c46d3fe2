// LININOIO ETHERD — WIRE PROTOCOL
// Canonical definitions for the lininoio on-wire format.
// All multi-byte fields are little-endian, no padding. The codec is pure:
// encode/decode only, no state, no I/O.

use bytemuck::{Pod, Zeroable};
use std::mem;

use crate::error::{Error, Result};

/// IEEE 802.1 Local Experimental EtherType for lininoio frames.
pub const ETH_P_LININOIO: u16 = 0x86B5;

/// First payload byte of every frame.
pub const PACKET_AREQUEST: u8 = 1;
pub const PACKET_AREPLY: u8 = 2;
pub const PACKET_DATA: u8 = 3;

// Well-known protocol ids.
pub const PROTO_MCUIO_V0: u16 = 0x0001;
pub const PROTO_CONSOLE: u16 = 0x0002;
pub const PROTO_RPMSG: u16 = 0x0003;

/// Protocol id space: 13 bits of the channel descriptor.
pub const N_PROTOS: usize = 1 << 13;
pub const MAX_NCHANNELS: usize = 16;
pub const MAX_NCORES: usize = 8;

/// Node name field width. Names are NUL-padded, so effective length < 16.
pub const NAME_LEN: usize = 16;

// ============================================================================
// PACKED FIELD CODECS
// ============================================================================

/// Channel descriptor: core_id(3 bits, high) | proto_id(13 bits, low).
#[inline(always)]
pub fn cdescr(core_id: u8, proto_id: u16) -> u16 {
    ((core_id as u16) << 13) | (proto_id & 0x1fff)
}

#[inline(always)]
pub fn cdescr_core_id(descr: u16) -> u8 {
    (descr >> 13) as u8
}

#[inline(always)]
pub fn cdescr_proto_id(descr: u16) -> u16 {
    descr & 0x1fff
}

/// cdlen: chan_id(4 bits, high) | payload_len(12 bits, low).
#[inline(always)]
pub fn encode_cdlen(dlen: u16, chan_id: u8) -> u16 {
    ((chan_id as u16) << 12) | (dlen & 0xfff)
}

#[inline(always)]
pub fn decode_cdlen(cdlen: u16) -> (u16, u8) {
    (cdlen & 0xfff, (cdlen >> 12) as u8)
}

// ============================================================================
// PACKET HEADERS
// ============================================================================

/// AREQUEST fixed part. `nchannels` u16 channel descriptors follow.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ArequestHeader {
    pub ptype: u8,
    pub name: [u8; NAME_LEN],
    pub nchannels: u8,
}
const _: () = assert!(mem::size_of::<ArequestHeader>() == 18);

/// AREPLY fixed part. One association-data blob per channel follows,
/// in channel-id order: cdlen (u16 le) + payload bytes each.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct AreplyHeader {
    pub ptype: u8,
    pub status: u8,
}
const _: () = assert!(mem::size_of::<AreplyHeader>() == 2);

/// DATA fixed part. `payload_len(cdlen)` bytes follow.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct DataHeader {
    pub ptype: u8,
    pub cdlen: [u8; 2],
}
const _: () = assert!(mem::size_of::<DataHeader>() == 3);

// ============================================================================
// DECODE
// ============================================================================

/// A decoded inbound frame, borrowing the receive buffer.
pub enum Packet<'a> {
    Arequest(Arequest<'a>),
    Areply { status: u8, adata: &'a [u8] },
    Data { chan_id: u8, payload: &'a [u8] },
}

pub struct Arequest<'a> {
    name: &'a [u8; NAME_LEN],
    descrs: &'a [u8],
}

impl<'a> Arequest<'a> {
    /// Node name: bytes up to the first NUL, lossily decoded.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn nchannels(&self) -> usize {
        self.descrs.len() / 2
    }

    /// Channel descriptors in request order.
    pub fn descriptors(&self) -> impl Iterator<Item = u16> + 'a {
        self.descrs
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }
}

/// Decode one frame payload. Rejects truncated packets and unknown types;
/// trailing bytes beyond the declared lengths are ignored (link padding).
pub fn decode(buf: &[u8]) -> Result<Packet<'_>> {
    let &ptype = buf.first().ok_or(Error::Malformed("empty"))?;
    match ptype {
        PACKET_AREQUEST => {
            if buf.len() < mem::size_of::<ArequestHeader>() {
                return Err(Error::Malformed("arequest"));
            }
            let hdr: ArequestHeader =
                bytemuck::pod_read_unaligned(&buf[..mem::size_of::<ArequestHeader>()]);
            let want = hdr.nchannels as usize * 2;
            let rest = &buf[mem::size_of::<ArequestHeader>()..];
            if rest.len() < want {
                return Err(Error::Malformed("arequest descriptors"));
            }
            // Safe: NAME_LEN slice out of an 18-byte checked prefix.
            let name: &[u8; NAME_LEN] = buf[1..1 + NAME_LEN].try_into().unwrap();
            Ok(Packet::Arequest(Arequest {
                name,
                descrs: &rest[..want],
            }))
        }
        PACKET_AREPLY => {
            if buf.len() < mem::size_of::<AreplyHeader>() {
                return Err(Error::Malformed("areply"));
            }
            Ok(Packet::Areply {
                status: buf[1],
                adata: &buf[2..],
            })
        }
        PACKET_DATA => {
            if buf.len() < mem::size_of::<DataHeader>() {
                return Err(Error::Malformed("data"));
            }
            let cdlen = u16::from_le_bytes([buf[1], buf[2]]);
            let (dlen, chan_id) = decode_cdlen(cdlen);
            let payload = &buf[3..];
            if payload.len() < dlen as usize {
                return Err(Error::Malformed("data payload"));
            }
            Ok(Packet::Data {
                chan_id,
                payload: &payload[..dlen as usize],
            })
        }
        other => Err(Error::UnknownPacketType(other)),
    }
}

// ============================================================================
// ENCODE
// ============================================================================

/// AREPLY fixed segment. Status 0 = association accepted.
pub fn areply_header(status: u8) -> [u8; 2] {
    [PACKET_AREPLY, status]
}

/// One association-data segment: cdlen + payload. The payload is clamped to
/// the 12-bit length field so the declared and carried lengths always agree.
pub fn adata_segment(chan_id: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(0xfff)];
    let cdlen = encode_cdlen(payload.len() as u16, chan_id);
    let mut seg = Vec::with_capacity(2 + payload.len());
    seg.extend_from_slice(&cdlen.to_le_bytes());
    seg.extend_from_slice(payload);
    seg
}

/// Whole DATA frame for the outbound path.
pub fn data_frame(chan_id: u8, payload: &[u8]) -> Vec<u8> {
    let cdlen = encode_cdlen(payload.len() as u16, chan_id);
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(PACKET_DATA);
    frame.extend_from_slice(&cdlen.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Whole AREQUEST frame. Used by tests and by peers implemented on top of
/// this crate; etherd itself only receives these.
pub fn arequest_frame(name: &str, descrs: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(18 + descrs.len() * 2);
    frame.push(PACKET_AREQUEST);
    let mut namebuf = [0u8; NAME_LEN];
    let n = name.len().min(NAME_LEN);
    namebuf[..n].copy_from_slice(&name.as_bytes()[..n]);
    frame.extend_from_slice(&namebuf);
    frame.push(descrs.len() as u8);
    for d in descrs {
        frame.extend_from_slice(&d.to_le_bytes());
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdlen_round_trips_over_full_domain() {
        for len in 0u16..=0xfff {
            for id in 0u8..16 {
                assert_eq!(decode_cdlen(encode_cdlen(len, id)), (len, id));
            }
        }
    }

    #[test]
    fn cdescr_round_trips_over_full_domain() {
        for core in 0u8..8 {
            for proto in 0u16..0x2000 {
                let d = cdescr(core, proto);
                assert_eq!(cdescr_core_id(d), core);
                assert_eq!(cdescr_proto_id(d), proto);
            }
        }
    }

    #[test]
    fn arequest_decodes() {
        let frame = arequest_frame("yun-1", &[cdescr(0, PROTO_CONSOLE), cdescr(1, PROTO_MCUIO_V0)]);
        match decode(&frame).unwrap() {
            Packet::Arequest(rq) => {
                assert_eq!(rq.name(), "yun-1");
                assert_eq!(rq.nchannels(), 2);
                let ds: Vec<u16> = rq.descriptors().collect();
                assert_eq!(cdescr_proto_id(ds[0]), PROTO_CONSOLE);
                assert_eq!(cdescr_core_id(ds[1]), 1);
            }
            _ => panic!("wrong packet kind"),
        }
    }

    #[test]
    fn truncated_arequest_rejected() {
        let mut frame = arequest_frame("x", &[cdescr(0, 1)]);
        frame.truncate(frame.len() - 1);
        assert!(decode(&frame).is_err());
        assert!(decode(&frame[..10]).is_err());
    }

    #[test]
    fn data_decodes_and_ignores_padding() {
        let mut frame = data_frame(5, b"hello");
        frame.extend_from_slice(&[0u8; 7]); // link-layer pad
        match decode(&frame).unwrap() {
            Packet::Data { chan_id, payload } => {
                assert_eq!(chan_id, 5);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("wrong packet kind"),
        }
    }

    #[test]
    fn short_data_payload_rejected() {
        let frame = [PACKET_DATA, 0x05, 0x00, b'a', b'b']; // claims 5, carries 2
        assert!(matches!(decode(&frame), Err(Error::Malformed(_))));
    }

    #[test]
    fn oversized_adata_is_clamped_consistently() {
        let big = vec![0x5au8; 0x1800];
        let seg = adata_segment(3, &big);
        let (dlen, chan_id) = decode_cdlen(u16::from_le_bytes([seg[0], seg[1]]));
        assert_eq!(chan_id, 3);
        assert_eq!(dlen, 0xfff);
        // declared length matches what the segment actually carries
        assert_eq!(seg.len(), 2 + dlen as usize);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(matches!(
            decode(&[0x7f, 0, 0]),
            Err(Error::UnknownPacketType(0x7f))
        ));
        assert!(decode(&[]).is_err());
    }
}
