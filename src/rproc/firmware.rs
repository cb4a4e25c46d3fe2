// LININOIO ETHERD — FIRMWARE IMAGE
// Assembles the "simple firmware" image a registered core boots from:
//
//   r2p header            -------> magic (u32)
//                                  length (u32)
//   resource table        -------> ver (u32) = 1
//                                  num (u32) = channel count
//                                  reserved[2] (u32)
//                                  offset[num] (u32)
//   ================ resource 0 =======================
//   fw_rsc_hdr            -------> type (u32)
//   ...per-channel handler-supplied blob...
//   ===================================================
//   ... resource num-1 ...
//
// Offsets are relative to the resource table start; the header length
// covers the table through the last blob.

use bytemuck::{Pod, Zeroable};
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};

/// Magic identifying a r2proc simple-firmware image.
pub const R2P_SIMPLE_FW_MAGIC: u32 = 0x5232_5046;

/// Where firmware images are published for the kernel loader.
pub const FIRMWARE_DIR: &str = "/lib/firmware";

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct R2pFwHeader {
    pub magic: u32,
    pub len: u32,
}
const _: () = assert!(mem::size_of::<R2pFwHeader>() == 8);

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ResourceTableHeader {
    pub ver: u32,
    pub num: u32,
    pub reserved: [u32; 2],
}
const _: () = assert!(mem::size_of::<ResourceTableHeader>() == 16);

// Remoteproc resource entries, as handlers embed them in their blobs.

pub const RSC_VDEV: u32 = 3;
pub const VIRTIO_ID_RPROC_SERIAL: u32 = 11;

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FwRscHdr {
    pub rtype: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FwRscVdev {
    pub id: u32,
    pub notifyid: u32,
    pub dfeatures: u32,
    pub gfeatures: u32,
    pub config_len: u32,
    pub status: u8,
    pub num_of_vrings: u8,
    pub reserved: [u8; 2],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FwRscVdevVring {
    pub da: u32,
    pub align: u32,
    pub num: u32,
    pub notifyid: u32,
    pub reserved: u32,
}

/// Build the image from the per-channel resource blobs, in channel order.
pub fn build_image(resources: &[&[u8]]) -> Vec<u8> {
    let num = resources.len();
    let table_len =
        mem::size_of::<ResourceTableHeader>() + num * 4 + resources.iter().map(|r| r.len()).sum::<usize>();
    let mut image = Vec::with_capacity(mem::size_of::<R2pFwHeader>() + table_len);

    let hdr = R2pFwHeader {
        magic: R2P_SIMPLE_FW_MAGIC,
        len: table_len as u32,
    };
    image.extend_from_slice(bytemuck::bytes_of(&hdr));

    let table = ResourceTableHeader {
        ver: 1,
        num: num as u32,
        reserved: [0; 2],
    };
    image.extend_from_slice(bytemuck::bytes_of(&table));

    // Offset array, relative to the resource table start.
    let mut offset = (mem::size_of::<ResourceTableHeader>() + num * 4) as u32;
    for r in resources {
        image.extend_from_slice(&offset.to_le_bytes());
        offset += r.len() as u32;
    }
    for r in resources {
        image.extend_from_slice(r);
    }
    image
}

/// Firmware reference string for a core: `<core-name>-fw`.
pub fn firmware_name(core_name: &str) -> String {
    format!("{core_name}-fw")
}

/// Write the image where the kernel loader looks for it.
pub fn publish(dir: &Path, fw_name: &str, image: &[u8]) -> io::Result<PathBuf> {
    let path = dir.join(fw_name);
    fs::write(&path, image)?;
    Ok(path)
}
