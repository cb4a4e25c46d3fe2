// LININOIO ETHERD — CONSOLE HANDLER
// Bridges a core's serial console channel to a host pseudo-terminal. The
// channel advertises a rproc-serial vdev resource; core-to-host bytes
// arriving through the channel are written to the pty master, where any
// terminal attached to the slave side sees them.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use bytemuck::bytes_of;
use log::{debug, info, warn};

use crate::error::Result;
use crate::protocol::handler::ProtoOps;
use crate::protocol::node::{Channel, NodeInfo};
use crate::rproc::firmware::{FwRscHdr, FwRscVdev, FwRscVdevVring, RSC_VDEV, VIRTIO_ID_RPROC_SERIAL};
use crate::virtio::backend::VRING_NUM;

const VRING_ALIGN: u32 = 16;
const CONFIG_LEN: u32 = 16;

struct ConsolePty {
    master: OwnedFd,
}

pub struct ConsoleHandler;

fn open_pty() -> io::Result<(OwnedFd, String)> {
    let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let master = unsafe { OwnedFd::from_raw_fd(fd) };
    unsafe {
        if libc::grantpt(master.as_raw_fd()) < 0 || libc::unlockpt(master.as_raw_fd()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    let mut name = [0 as libc::c_char; 64];
    let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    let slave = unsafe { CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok((master, slave))
}

/// vdev resource entry the firmware image carries for one console channel.
fn vdev_resource() -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(bytes_of(&FwRscHdr { rtype: RSC_VDEV }));
    blob.extend_from_slice(bytes_of(&FwRscVdev {
        id: VIRTIO_ID_RPROC_SERIAL,
        notifyid: 0,
        dfeatures: 0,
        gfeatures: 0,
        config_len: CONFIG_LEN,
        status: 0,
        num_of_vrings: 2,
        reserved: [0; 2],
    }));
    for notifyid in 0..2u32 {
        blob.extend_from_slice(bytes_of(&FwRscVdevVring {
            da: 0,
            align: VRING_ALIGN,
            num: VRING_NUM as u32,
            notifyid,
            reserved: 0,
        }));
    }
    blob.extend_from_slice(&[0u8; CONFIG_LEN as usize]); // config space
    blob
}

impl ProtoOps for ConsoleHandler {
    fn connect(&self, chan: &mut Channel, node: &NodeInfo) -> Result<()> {
        let (master, slave) = open_pty()?;
        info!("console for {} channel {} at {slave}", node.name, chan.id);
        chan.resources = vdev_resource();
        chan.priv_data = Some(Box::new(ConsolePty { master }));
        Ok(())
    }

    fn inbound_packet(&self, chan: &mut Channel, payload: &[u8]) {
        let Some(pty) = chan
            .priv_data
            .as_ref()
            .and_then(|p| p.downcast_ref::<ConsolePty>())
        else {
            return;
        };
        let n = unsafe {
            libc::write(
                pty.master.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        if n < 0 {
            warn!("console write: {}", io::Error::last_os_error());
        }
    }

    fn disconnect(&self, chan: &mut Channel, node: &NodeInfo) {
        debug!("console for {} channel {} closed", node.name, chan.id);
        chan.priv_data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn resource_blob_describes_a_serial_vdev() {
        let blob = vdev_resource();
        let hdr_len = mem::size_of::<FwRscHdr>();
        let vdev_len = mem::size_of::<FwRscVdev>();
        let vring_len = mem::size_of::<FwRscVdevVring>();
        assert_eq!(blob.len(), hdr_len + vdev_len + 2 * vring_len + 16);

        let hdr: FwRscHdr = bytemuck::pod_read_unaligned(&blob[..hdr_len]);
        assert_eq!({ hdr.rtype }, RSC_VDEV);

        let vdev: FwRscVdev = bytemuck::pod_read_unaligned(&blob[hdr_len..hdr_len + vdev_len]);
        assert_eq!({ vdev.id }, VIRTIO_ID_RPROC_SERIAL);
        assert_eq!(vdev.num_of_vrings, 2);
        assert_eq!({ vdev.config_len }, 16);

        let v0: FwRscVdevVring =
            bytemuck::pod_read_unaligned(&blob[hdr_len + vdev_len..hdr_len + vdev_len + vring_len]);
        assert_eq!({ v0.align }, VRING_ALIGN);
        assert_eq!({ v0.num }, VRING_NUM as u32);
    }

    #[test]
    fn pty_opens_and_names_a_slave() {
        let (master, slave) = open_pty().unwrap();
        assert!(master.as_raw_fd() >= 0);
        assert!(slave.starts_with("/dev/pts/"));
    }
}
