// LININOIO ETHERD — MCUIO HANDLER
// Enrolls each mcuio channel as a device on a bus served by the local
// mcuiod daemon. Buses are reached over a unix socket and hold up to 8
// devices tracked in a free bitmap; a new bus is opened only when every
// existing one is full. The assigned device number travels back to the
// core as one byte of association data.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::unix::net::UnixStream;

use log::{debug, info, warn};

use crate::error::Result;
use crate::protocol::handler::ProtoOps;
use crate::protocol::node::{Channel, NodeInfo};

pub const MCUIOD_SOCKET_PATH: &str = "/var/run/mcuiod_socket";

const ALL_DEVS_FREE: u8 = 0xff;

struct Bus {
    id: u32,
    stream: UnixStream,
    free_devs: u8,
}

struct McuioLink {
    bus_id: u32,
    dev: u8,
}

pub struct McuioHandler {
    socket_path: String,
    buses: RefCell<Vec<Bus>>,
    next_bus_id: Cell<u32>,
}

impl McuioHandler {
    pub fn new(socket_path: &str) -> Self {
        McuioHandler {
            socket_path: socket_path.to_owned(),
            buses: RefCell::new(Vec::new()),
            next_bus_id: Cell::new(0),
        }
    }

    /// Take the lowest free device slot, opening a new bus when every
    /// existing one is full.
    fn alloc_dev(&self) -> Result<(u32, u8)> {
        let mut buses = self.buses.borrow_mut();
        for bus in buses.iter_mut() {
            if bus.free_devs != 0 {
                let dev = bus.free_devs.trailing_zeros() as u8;
                bus.free_devs &= !(1 << dev);
                return Ok((bus.id, dev));
            }
        }
        let stream = UnixStream::connect(&self.socket_path)?;
        let id = self.next_bus_id.get();
        self.next_bus_id.set(id + 1);
        info!("mcuio bus {id} opened");
        buses.push(Bus {
            id,
            stream,
            free_devs: ALL_DEVS_FREE & !1,
        });
        Ok((id, 0))
    }

    fn free_dev(&self, bus_id: u32, dev: u8) {
        let mut buses = self.buses.borrow_mut();
        let Some(pos) = buses.iter().position(|b| b.id == bus_id) else {
            return;
        };
        buses[pos].free_devs |= 1 << dev;
        if buses[pos].free_devs == ALL_DEVS_FREE {
            info!("mcuio bus {bus_id} closed");
            buses.remove(pos);
        }
    }
}

impl ProtoOps for McuioHandler {
    fn connect(&self, chan: &mut Channel, node: &NodeInfo) -> Result<()> {
        let (bus_id, dev) = self.alloc_dev()?;
        debug!("mcuio {}: channel {} is bus {bus_id} dev {dev}", node.name, chan.id);
        chan.adata = vec![dev];
        chan.priv_data = Some(Box::new(McuioLink { bus_id, dev }));
        Ok(())
    }

    fn inbound_packet(&self, chan: &mut Channel, payload: &[u8]) {
        let Some(link) = chan
            .priv_data
            .as_ref()
            .and_then(|p| p.downcast_ref::<McuioLink>())
        else {
            return;
        };
        let buses = self.buses.borrow();
        let Some(bus) = buses.iter().find(|b| b.id == link.bus_id) else {
            return;
        };
        if let Err(e) = (&bus.stream).write_all(payload) {
            warn!("mcuio bus {} write: {e}", link.bus_id);
        }
    }

    fn disconnect(&self, chan: &mut Channel, node: &NodeInfo) {
        let Some(link) = chan
            .priv_data
            .take()
            .and_then(|p| p.downcast::<McuioLink>().ok())
        else {
            return;
        };
        debug!("mcuio {}: released bus {} dev {}", node.name, link.bus_id, link.dev);
        self.free_dev(link.bus_id, link.dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::node::{LinkAddr, NodeArena};
    use crate::protocol::wire::PROTO_MCUIO_V0;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    fn sock_path(tag: &str) -> String {
        let path = std::env::temp_dir().join(format!("mcuiod-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path.to_str().unwrap().to_owned()
    }

    #[test]
    fn devices_pack_onto_one_bus_and_release_closes_it() {
        let path = sock_path("pack");
        let _listener = UnixListener::bind(&path).unwrap();
        let handler = McuioHandler::new(&path);

        let mut arena = NodeArena::new();
        let h = arena.allocate(LinkAddr([2, 0, 0, 0, 0, 1]), "yun").unwrap();
        let node = arena.get_mut(h).unwrap();
        let info = node.info();

        let mut adatas = Vec::new();
        for id in 0..3u8 {
            let chan = node.add_channel(id, 0, PROTO_MCUIO_V0);
            handler.connect(chan, &info).unwrap();
            adatas.push(chan.adata.clone());
        }
        assert_eq!(adatas, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(handler.buses.borrow().len(), 1);

        for id in 0..3u8 {
            let mut chan = node.take_channel(id).unwrap();
            handler.disconnect(&mut chan, &info);
        }
        assert!(handler.buses.borrow().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ninth_device_opens_a_second_bus() {
        let path = sock_path("spill");
        let _listener = UnixListener::bind(&path).unwrap();
        let handler = McuioHandler::new(&path);

        let mut arena = NodeArena::new();
        let h = arena.allocate(LinkAddr([2, 0, 0, 0, 0, 2]), "yun").unwrap();
        let node = arena.get_mut(h).unwrap();
        let info = node.info();

        for id in 0..9u8 {
            let chan = node.add_channel(id, 0, PROTO_MCUIO_V0);
            handler.connect(chan, &info).unwrap();
        }
        assert_eq!(handler.buses.borrow().len(), 2);
        // first device of the second bus starts from slot 0 again
        assert_eq!(node.channel(8).unwrap().adata, vec![0]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn inbound_payload_reaches_the_bus_socket() {
        let path = sock_path("fwd");
        let listener = UnixListener::bind(&path).unwrap();
        let handler = McuioHandler::new(&path);

        let mut arena = NodeArena::new();
        let h = arena.allocate(LinkAddr([2, 0, 0, 0, 0, 3]), "yun").unwrap();
        let node = arena.get_mut(h).unwrap();
        let info = node.info();

        let chan = node.add_channel(0, 0, PROTO_MCUIO_V0);
        handler.connect(chan, &info).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        handler.inbound_packet(chan, b"\x10\x20\x30");
        let mut got = [0u8; 3];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"\x10\x20\x30");

        let _ = std::fs::remove_file(&path);
    }
}
