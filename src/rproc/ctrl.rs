// LININOIO ETHERD — R2PROC CONTROL DEVICE
// Registers each completed core with the kernel r2proc framework through
// ioctls on the control device, and tracks what must be unwound when the
// owning node dies: the registration itself, the start/stop eventfds and
// the published firmware image.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use log::{error, info, warn};

use crate::rproc::firmware;

/// Control device for remote-processor registration.
pub const R2PROC_DEV: &str = "/dev/r2proc";

/// Firmware type tag: image published as a simple firmware file.
pub const R2P_FW_SIMPLE: u32 = 1;

/// Shared memory reserved per core to back its virtqueues.
pub const BACKEND_MEM_SIZE: u64 = 1024 * 1024;

const NAME_FIELD: usize = 64;

/// Registration record handed to the control device.
#[repr(C)]
pub struct R2pProcData {
    pub fw_type: u32,
    pub fw_name: [u8; NAME_FIELD],
    pub name: [u8; NAME_FIELD],
    pub start_fd: i32,
    pub stop_fd: i32,
    pub reserved_memsize: u64,
}

// Linux ioctl encoding, write direction.
const fn iow(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    const IOC_WRITE: libc::c_ulong = 1;
    (IOC_WRITE << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

pub const R2P_ADD_PROC: libc::c_ulong = iow(b'r', 1, mem::size_of::<R2pProcData>());
pub const R2P_DEL_PROC: libc::c_ulong = iow(b'r', 2, NAME_FIELD);

fn name_field(s: &str) -> [u8; NAME_FIELD] {
    let mut out = [0u8; NAME_FIELD];
    let n = s.len().min(NAME_FIELD - 1);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

struct RegisteredCore {
    start: OwnedFd,
    stop: OwnedFd,
    fw_path: PathBuf,
}

pub struct RprocBridge {
    fw_dir: PathBuf,
    cores: HashMap<String, RegisteredCore>,
}

impl RprocBridge {
    pub fn new(fw_dir: PathBuf) -> Self {
        RprocBridge {
            fw_dir,
            cores: HashMap::new(),
        }
    }

    /// Build and publish the core's firmware, then register it. Returns the
    /// (start, stop) signalling descriptors for the poll set. Any failure
    /// aborts this core only and removes the now-unreferenced image.
    pub fn setup_core(&mut self, core_name: &str, resources: &[&[u8]]) -> io::Result<(RawFd, RawFd)> {
        let fw_name = firmware::firmware_name(core_name);
        let image = firmware::build_image(resources);
        let fw_path = firmware::publish(&self.fw_dir, &fw_name, &image)?;
        info!("published firmware {}", fw_path.display());

        let result = (|| {
            let start = eventfd()?;
            let stop = eventfd()?;
            let pd = R2pProcData {
                fw_type: R2P_FW_SIMPLE,
                fw_name: name_field(&fw_name),
                name: name_field(core_name),
                start_fd: start.as_raw_fd(),
                stop_fd: stop.as_raw_fd(),
                reserved_memsize: BACKEND_MEM_SIZE,
            };
            ioctl_ctrl(R2P_ADD_PROC, &pd as *const R2pProcData as *const libc::c_void)?;
            Ok::<_, io::Error>((start, stop))
        })();

        match result {
            Ok((start, stop)) => {
                let fds = (start.as_raw_fd(), stop.as_raw_fd());
                self.cores.insert(
                    core_name.to_owned(),
                    RegisteredCore {
                        start,
                        stop,
                        fw_path,
                    },
                );
                Ok(fds)
            }
            Err(e) => {
                if let Err(ue) = fs::remove_file(&fw_path) {
                    warn!("removing unused firmware {}: {ue}", fw_path.display());
                }
                Err(e)
            }
        }
    }

    /// The core acknowledged a start/stop edge; drain one 8-byte counter
    /// read so the descriptor goes quiet again.
    pub fn drain_event(&self, fd: RawFd) {
        let mut v = [0u8; 8];
        let n = unsafe { libc::read(fd, v.as_mut_ptr() as *mut libc::c_void, 8) };
        if n < 0 {
            error!("eventfd read: {}", io::Error::last_os_error());
        }
    }

    /// Unwind every registration belonging to a dead node. Returns the raw
    /// descriptors the caller must drop from its poll set; the fds
    /// themselves close here.
    pub fn teardown_node(&mut self, core_names: &[String]) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for name in core_names {
            let Some(core) = self.cores.remove(name) else {
                continue;
            };
            if let Err(e) = del_proc(name) {
                error!("deregistering core {name}: {e}");
            }
            if let Err(e) = fs::remove_file(&core.fw_path) {
                warn!("removing firmware {}: {e}", core.fw_path.display());
            }
            fds.push(core.start.as_raw_fd());
            fds.push(core.stop.as_raw_fd());
            info!("core {name} deregistered");
        }
        fds
    }
}

fn open_ctrl() -> io::Result<OwnedFd> {
    let path = std::ffi::CString::new(R2PROC_DEV).expect("static path");
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl_ctrl(req: libc::c_ulong, arg: *const libc::c_void) -> io::Result<()> {
    let ctrl = open_ctrl()?;
    let rc = unsafe { libc::ioctl(ctrl.as_raw_fd(), req, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn del_proc(core_name: &str) -> io::Result<()> {
    let name = name_field(core_name);
    ioctl_ctrl(R2P_DEL_PROC, name.as_ptr() as *const libc::c_void)
}

/// Resource blobs for one core, cloned out of the arena in channel order.
pub fn core_resources(node: &crate::protocol::node::Node, core_id: u8) -> Vec<Vec<u8>> {
    let Some(core) = node.core(core_id) else {
        return Vec::new();
    };
    core.channels
        .iter()
        .filter_map(|&id| node.channel(id).map(|c| c.resources.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_field_is_nul_terminated_and_clamped() {
        let f = name_field("yun-0");
        assert_eq!(&f[..5], b"yun-0");
        assert_eq!(f[5], 0);
        let long = "x".repeat(100);
        let f = name_field(&long);
        assert_eq!(f[NAME_FIELD - 1], 0);
        assert!(f[..NAME_FIELD - 1].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn ioctl_codes_encode_direction_size_type() {
        let code = R2P_ADD_PROC;
        assert_eq!(code >> 30, 1); // write
        assert_eq!((code >> 16) & 0x3fff, mem::size_of::<R2pProcData>() as libc::c_ulong);
        assert_eq!((code >> 8) & 0xff, b'r' as libc::c_ulong);
        assert_eq!(code & 0xff, 1);
    }
}
