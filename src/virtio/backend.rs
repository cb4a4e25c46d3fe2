// LININOIO ETHERD — BACKEND BRIDGE
// Binds hotplugged r2proc backend devices to the engine channels behind
// them. Each backend device exposes one vring of one channel; the device
// minor encodes which: minor >> 1 is the channel index within the core,
// minor & 1 the vring index. Vring 1 carries core-to-host traffic; kicks
// arrive as reads on the device descriptor.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::{debug, error, info, warn};
use memmap2::{Mmap, MmapOptions};

use crate::hotplug::{self, Uevent};
use crate::net::ether::EtherEngine;
use crate::protocol::node::NodeHandle;
use crate::virtio::vring::VringView;

/// Ring size the resource entries advertise; the guest publishes rings
/// of exactly this many descriptors.
pub const VRING_NUM: u16 = 4;

/// Core whose backend devices are about to hotplug.
#[derive(Clone)]
pub struct CoreLink {
    pub node: NodeHandle,
    pub core_id: u8,
    pub core_name: String,
}

struct Backend {
    devname: String,
    file: File,
    view: VringView<Mmap>,
    last_avail: u16,
    node: NodeHandle,
    chan_id: u8,
    vring_index: u32,
}

/// Bridges backend device hotplug into engine deliveries.
pub struct VirtioBridge {
    dev_dir: String,
    current: Option<CoreLink>,
    backends: Vec<Backend>,
}

/// Channel index and vring index packed into a backend device minor.
pub fn correlate(minor: u32) -> (u8, u32) {
    ((minor >> 1) as u8, minor & 1)
}

impl VirtioBridge {
    pub fn new() -> Self {
        VirtioBridge {
            dev_dir: "/dev".to_owned(),
            current: None,
            backends: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_dev_dir(dir: &str) -> Self {
        VirtioBridge {
            dev_dir: dir.to_owned(),
            current: None,
            backends: Vec::new(),
        }
    }

    /// Devices added from now on belong to this core. Registration is
    /// synchronous in the main loop, so the kernel's add events for a
    /// core always land while its link is current.
    pub fn expect_core(&mut self, link: CoreLink) {
        self.current = Some(link);
    }

    /// Map a hotplugged backend device. Returns the descriptor to poll
    /// for kicks, or None when the device is not one we can serve.
    pub fn add_device(&mut self, ev: &Uevent) -> io::Result<Option<RawFd>> {
        let Some(link) = self.current.clone() else {
            warn!("backend device with no pending core, ignoring");
            return Ok(None);
        };
        let (Some(devname), Some(minor)) = (ev.devname.as_deref(), ev.minor) else {
            warn!("backend uevent without DEVNAME/MINOR");
            return Ok(None);
        };
        let (chan_id, vring_index) = correlate(minor);

        let phy_offset = hotplug::read_sysattr_hex(&ev.devpath, "phy_offset")?;
        let phy_len = hotplug::read_sysattr_hex(&ev.devpath, "phy_len")?;

        let file = File::open(Path::new(&self.dev_dir).join(devname))?;
        let map = unsafe {
            MmapOptions::new()
                .offset(phy_offset)
                .len(phy_len as usize)
                .map(&file)?
        };
        let view = VringView::new(map, VRING_NUM, phy_offset)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        info!(
            "backend {devname}: core {} channel {chan_id} vring {vring_index}",
            link.core_name
        );
        let fd = file.as_raw_fd();
        self.backends.push(Backend {
            devname: devname.to_owned(),
            file,
            view,
            last_avail: 0,
            node: link.node,
            chan_id,
            vring_index,
        });
        Ok(Some(fd))
    }

    /// A kick arrived on a backend descriptor; drain it and hand every
    /// newly available chain to the channel's handler.
    pub fn readable(&mut self, fd: RawFd, engine: &mut EtherEngine) {
        let Some(be) = self.backends.iter_mut().find(|b| b.file.as_raw_fd() == fd) else {
            return;
        };
        let mut kick = [0u8; 8];
        if let Err(e) = be.file.read_exact(&mut kick) {
            error!("backend {} kick read: {e}", be.devname);
        }
        if be.vring_index != 1 {
            // vring 0 is host-to-core; nothing to collect
            return;
        }
        let mut payload = Vec::new();
        loop {
            payload.clear();
            match be.view.pop_chain(&mut be.last_avail, &mut payload) {
                Ok(true) => {
                    debug!("backend {}: {} bytes from core", be.devname, payload.len());
                    engine.deliver_inbound(be.node, be.chan_id, &payload);
                }
                Ok(false) => break,
                Err(e) => {
                    error!("backend {}: {e}", be.devname);
                    break;
                }
            }
        }
    }

    /// Drop every backend belonging to a dead node. Returns the raw
    /// descriptors the caller must remove from its poll set.
    pub fn remove_node(&mut self, node: NodeHandle) -> Vec<RawFd> {
        let mut fds = Vec::new();
        self.backends.retain(|b| {
            if b.node == node {
                fds.push(b.file.as_raw_fd());
                info!("backend {} unmapped", b.devname);
                false
            } else {
                true
            }
        });
        if self.current.as_ref().is_some_and(|l| l.node == node) {
            self.current = None;
        }
        fds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_splits_into_channel_and_vring() {
        assert_eq!(correlate(0), (0, 0));
        assert_eq!(correlate(1), (0, 1));
        assert_eq!(correlate(5), (2, 1));
        assert_eq!(correlate(6), (3, 0));
    }

    #[test]
    fn device_without_pending_core_is_ignored() {
        let mut bridge = VirtioBridge::with_dev_dir("/nonexistent");
        let ev = Uevent {
            action: "add".to_owned(),
            devpath: "/devices/virtual/r2proc_backend/vb0".to_owned(),
            subsystem: "r2proc_backend".to_owned(),
            devname: Some("vb0".to_owned()),
            minor: Some(1),
        };
        assert!(matches!(bridge.add_device(&ev), Ok(None)));
    }
}
