// LININOIO ETHERD — VRING VIEW
// Read-only accessor over a guest-published vring living in the shared
// region a backend device maps. Layout (virtio legacy, align carried by
// the ring itself):
//
//   desc[num]    16 bytes each
//   avail.flags  u16
//   avail.idx    u16
//   avail.ring   u16 * num
//
// The guest owns the ring memory; every address and length coming out of
// it is untrusted and checked against the mapped region before use.

use bytemuck::{Pod, Zeroable};
use std::mem;
use std::ptr;

use crate::error::{Error, Result};

pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct VringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}
const _: () = assert!(mem::size_of::<VringDesc>() == 16);

/// View of one vring inside a mapped region. `phy_base` is the physical
/// address the region starts at; descriptor addresses are physical and
/// translate through it.
pub struct VringView<M: AsRef<[u8]>> {
    mem: M,
    num: u16,
    phy_base: u64,
}

impl<M: AsRef<[u8]>> VringView<M> {
    pub fn new(mem: M, num: u16, phy_base: u64) -> Result<Self> {
        let need = ring_bytes(num);
        let have = mem.as_ref().len();
        if have < need {
            return Err(Error::OutOfRange {
                offset: 0,
                len: need as u64,
                map_len: have as u64,
            });
        }
        Ok(VringView { mem, num, phy_base })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    // The guest updates avail.idx concurrently; read it volatile so we
    // never fold two polls into one stale value.
    pub fn avail_idx(&self) -> u16 {
        let off = self.num as usize * mem::size_of::<VringDesc>() + 2;
        unsafe { ptr::read_volatile(self.mem.as_ref().as_ptr().add(off) as *const u16) }
    }

    pub fn avail_ring(&self, slot: u16) -> u16 {
        let off = self.num as usize * mem::size_of::<VringDesc>() + 4 + (slot % self.num) as usize * 2;
        unsafe { ptr::read_volatile(self.mem.as_ref().as_ptr().add(off) as *const u16) }
    }

    pub fn desc(&self, index: u16) -> Result<VringDesc> {
        if index >= self.num {
            return Err(Error::BadDescriptor(index, self.num));
        }
        let off = index as usize * mem::size_of::<VringDesc>();
        Ok(bytemuck::pod_read_unaligned(
            &self.mem.as_ref()[off..off + mem::size_of::<VringDesc>()],
        ))
    }

    /// Translate a descriptor's guest-physical buffer into a slice of the
    /// mapped region.
    pub fn buffer(&self, desc: &VringDesc) -> Result<&[u8]> {
        let addr = desc.addr;
        let len = desc.len as u64;
        let map_len = self.mem.as_ref().len() as u64;
        let offset = addr
            .checked_sub(self.phy_base)
            .ok_or(Error::OutOfRange { offset: addr, len, map_len })?;
        let end = offset.checked_add(len).ok_or(Error::OutOfRange { offset, len, map_len })?;
        if end > map_len {
            return Err(Error::OutOfRange { offset, len, map_len });
        }
        Ok(&self.mem.as_ref()[offset as usize..end as usize])
    }

    /// Pop the next available descriptor chain, appending the readable
    /// buffers to `out`. Returns false when the ring has nothing new.
    /// `last_avail` is the caller's consumed index; it advances as soon as
    /// the head is read so a corrupt chain cannot wedge the ring.
    pub fn pop_chain(&self, last_avail: &mut u16, out: &mut Vec<u8>) -> Result<bool> {
        if *last_avail == self.avail_idx() {
            return Ok(false);
        }
        let head = self.avail_ring(*last_avail);
        *last_avail = last_avail.wrapping_add(1);

        let mut index = head;
        // hop limit guards against a cycle in the next pointers
        for _ in 0..self.num {
            let d = self.desc(index)?;
            if d.flags & VRING_DESC_F_WRITE == 0 {
                out.extend_from_slice(self.buffer(&d)?);
            }
            if d.flags & VRING_DESC_F_NEXT == 0 {
                return Ok(true);
            }
            index = d.next;
        }
        Err(Error::BadDescriptor(head, self.num))
    }
}

fn ring_bytes(num: u16) -> usize {
    num as usize * mem::size_of::<VringDesc>() + 4 + num as usize * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM: u16 = 4;
    const PHY: u64 = 0x1000;

    fn blank_ring() -> Vec<u8> {
        vec![0u8; ring_bytes(NUM) + 64]
    }

    fn put_desc(ring: &mut [u8], i: u16, d: VringDesc) {
        let off = i as usize * 16;
        ring[off..off + 16].copy_from_slice(bytemuck::bytes_of(&d));
    }

    fn put_avail(ring: &mut [u8], idx: u16, heads: &[u16]) {
        let base = NUM as usize * 16;
        ring[base + 2..base + 4].copy_from_slice(&idx.to_le_bytes());
        for (slot, h) in heads.iter().enumerate() {
            let off = base + 4 + slot * 2;
            ring[off..off + 2].copy_from_slice(&h.to_le_bytes());
        }
    }

    #[test]
    fn pop_walks_chain_and_skips_writable() {
        let mut ring = blank_ring();
        let data_at = ring_bytes(NUM);
        ring[data_at..data_at + 3].copy_from_slice(b"abc");
        ring[data_at + 3..data_at + 5].copy_from_slice(b"de");
        put_desc(
            &mut ring,
            0,
            VringDesc { addr: PHY + data_at as u64, len: 3, flags: VRING_DESC_F_NEXT, next: 1 },
        );
        // writable link in the middle is skipped, not copied
        put_desc(
            &mut ring,
            1,
            VringDesc { addr: PHY, len: 8, flags: VRING_DESC_F_WRITE | VRING_DESC_F_NEXT, next: 2 },
        );
        put_desc(
            &mut ring,
            2,
            VringDesc { addr: PHY + data_at as u64 + 3, len: 2, flags: 0, next: 0 },
        );
        put_avail(&mut ring, 1, &[0]);

        let view = VringView::new(ring, NUM, PHY).unwrap();
        let mut last = 0u16;
        let mut out = Vec::new();
        assert!(view.pop_chain(&mut last, &mut out).unwrap());
        assert_eq!(out, b"abcde");
        assert_eq!(last, 1);
        assert!(!view.pop_chain(&mut last, &mut out).unwrap());
    }

    #[test]
    fn buffer_outside_region_is_rejected() {
        let ring = blank_ring();
        let map_len = ring.len() as u64;
        let view = VringView::new(ring, NUM, PHY).unwrap();
        let below = VringDesc { addr: PHY - 1, len: 1, flags: 0, next: 0 };
        assert!(matches!(view.buffer(&below), Err(Error::OutOfRange { .. })));
        let past = VringDesc { addr: PHY + map_len - 2, len: 8, flags: 0, next: 0 };
        assert!(matches!(view.buffer(&past), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn cyclic_chain_errors_but_consumes_the_entry() {
        let mut ring = blank_ring();
        put_desc(&mut ring, 0, VringDesc { addr: PHY, len: 0, flags: VRING_DESC_F_NEXT, next: 0 });
        put_avail(&mut ring, 1, &[0]);
        let view = VringView::new(ring, NUM, PHY).unwrap();
        let mut last = 0u16;
        let mut out = Vec::new();
        assert!(view.pop_chain(&mut last, &mut out).is_err());
        // index advanced anyway so the ring does not wedge
        assert_eq!(last, 1);
    }

    #[test]
    fn short_region_is_rejected() {
        let short = vec![0u8; 16];
        assert!(VringView::new(short, NUM, PHY).is_err());
    }
}
