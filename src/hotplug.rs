// LININOIO ETHERD — HOTPLUG
// Kernel uevent listener for backend device add events. Messages arrive
// on a NETLINK_KOBJECT_UEVENT socket as NUL-separated KEY=VALUE records
// prefixed with an "action@devpath" line.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::debug;

/// Subsystem of the devices the bridge serves.
pub const BACKEND_SUBSYSTEM: &str = "r2proc_backend";

const NETLINK_KOBJECT_UEVENT: libc::c_int = 15;
const UEVENT_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub subsystem: String,
    pub devname: Option<String>,
    pub minor: Option<u32>,
}

/// Parse one raw uevent message. Returns None when the message is not
/// shaped like a kernel uevent.
pub fn parse_uevent(buf: &[u8]) -> Option<Uevent> {
    let mut records = buf.split(|&b| b == 0).filter(|r| !r.is_empty());
    let first = std::str::from_utf8(records.next()?).ok()?;
    let (action, devpath) = first.split_once('@')?;

    let mut ev = Uevent {
        action: action.to_owned(),
        devpath: devpath.to_owned(),
        subsystem: String::new(),
        devname: None,
        minor: None,
    };
    for rec in records {
        let Ok(rec) = std::str::from_utf8(rec) else {
            continue;
        };
        let Some((key, value)) = rec.split_once('=') else {
            continue;
        };
        match key {
            "SUBSYSTEM" => ev.subsystem = value.to_owned(),
            "DEVNAME" => ev.devname = Some(value.to_owned()),
            "MINOR" => ev.minor = value.parse().ok(),
            _ => {}
        }
    }
    Some(ev)
}

/// Listening socket for kernel uevents.
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM,
                NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = std::process::id();
        addr.nl_groups = 1; // kernel broadcast group
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(UeventSocket { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read the next add event for our subsystem, skipping everything
    /// else queued on the socket.
    pub fn next_backend_add(&self) -> io::Result<Option<Uevent>> {
        let mut buf = [0u8; UEVENT_BUF_SIZE];
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let Some(ev) = parse_uevent(&buf[..n as usize]) else {
            return Ok(None);
        };
        if ev.subsystem != BACKEND_SUBSYSTEM || ev.action != "add" {
            debug!("ignoring uevent {}@{}", ev.action, ev.devpath);
            return Ok(None);
        }
        Ok(Some(ev))
    }
}

/// Read a hex-formatted sysfs attribute of a hotplugged device.
pub fn read_sysattr_hex(devpath: &str, attr: &str) -> io::Result<u64> {
    let path = format!("/sys{devpath}/{attr}");
    let text = std::fs::read_to_string(&path)?;
    parse_hex(&text).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("bad {attr} value {text:?}"))
    })
}

fn parse_hex(text: &str) -> Option<u64> {
    let t = text.trim();
    let t = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).unwrap_or(t);
    u64::from_str_radix(t, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_event_with_device_fields() {
        let raw = b"add@/devices/virtual/r2proc_backend/vb3\0\
                    ACTION=add\0\
                    DEVPATH=/devices/virtual/r2proc_backend/vb3\0\
                    SUBSYSTEM=r2proc_backend\0\
                    DEVNAME=vb3\0\
                    MAJOR=250\0\
                    MINOR=3\0";
        let ev = parse_uevent(raw).unwrap();
        assert_eq!(ev.action, "add");
        assert_eq!(ev.devpath, "/devices/virtual/r2proc_backend/vb3");
        assert_eq!(ev.subsystem, "r2proc_backend");
        assert_eq!(ev.devname.as_deref(), Some("vb3"));
        assert_eq!(ev.minor, Some(3));
    }

    #[test]
    fn header_without_at_sign_is_rejected() {
        assert!(parse_uevent(b"libudev\0junk\0").is_none());
        assert!(parse_uevent(b"").is_none());
    }

    #[test]
    fn hex_values_accept_optional_prefix() {
        assert_eq!(parse_hex("0x1f400000\n"), Some(0x1f40_0000));
        assert_eq!(parse_hex("  4000 "), Some(0x4000));
        assert_eq!(parse_hex("zz"), None);
    }
}
