// LININOIO ETHERD — PROTOCOL HANDLER REGISTRY
// Maps a 13-bit protocol id to a handler. Unknown ids are resolved once
// through the injected discovery capability and memoized; a failed lookup is
// logged and the channel simply stays without operations.

use std::rc::Rc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::node::{Channel, NodeInfo};
use crate::protocol::wire::N_PROTOS;

/// Class tag protocol-handler modules advertise to the discovery mechanism.
pub const HANDLER_CLASS: &str = "lininoio-proto-handler";

/// One protocol's behavior. Handlers are single-threaded like the rest of
/// the daemon; mutable handler state lives behind interior mutability.
pub trait ProtoOps {
    /// Invoked once at channel creation. May populate the channel's
    /// association data and resource blob. An error aborts the whole
    /// association.
    fn connect(&self, chan: &mut Channel, node: &NodeInfo) -> Result<()>;

    /// Best-effort delivery of one inbound payload. No return value is
    /// observed by the core.
    fn inbound_packet(&self, chan: &mut Channel, payload: &[u8]);

    /// Invoked once at channel teardown. Must release anything connect
    /// allocated.
    fn disconnect(&self, chan: &mut Channel, node: &NodeInfo);
}

/// Discovery capability: given a protocol id, produce a handler instance.
/// Injected into the registry so the engine carries no dependency on any
/// particular module-loading mechanism.
pub trait HandlerDiscovery {
    fn load(&self, proto_id: u16) -> Option<Rc<dyn ProtoOps>>;
}

pub struct ProtoRegistry {
    ops: Vec<Option<Rc<dyn ProtoOps>>>,
    discovery: Box<dyn HandlerDiscovery>,
}

impl ProtoRegistry {
    /// Allocates the full 8192-entry table up front; this is the one
    /// allocation whose failure is fatal to startup.
    pub fn new(discovery: Box<dyn HandlerDiscovery>) -> Self {
        ProtoRegistry {
            ops: vec![None; N_PROTOS],
            discovery,
        }
    }

    /// Statically register a handler, bypassing discovery.
    pub fn register(&mut self, proto_id: u16, ops: Rc<dyn ProtoOps>) -> Result<()> {
        if proto_id as usize >= N_PROTOS {
            return Err(Error::NoHandler(proto_id));
        }
        self.ops[proto_id as usize] = Some(ops);
        Ok(())
    }

    /// Resolve a protocol id to its handler. First reference per id goes
    /// through discovery; the result is cached for the process lifetime.
    /// A miss is not fatal: the caller's channel is left without ops.
    pub fn resolve(&mut self, proto_id: u16) -> Option<Rc<dyn ProtoOps>> {
        if proto_id as usize >= N_PROTOS {
            return None;
        }
        if let Some(ops) = &self.ops[proto_id as usize] {
            return Some(Rc::clone(ops));
        }
        match self.discovery.load(proto_id) {
            Some(ops) => {
                debug!("loaded handler for proto {proto_id:#06x}");
                self.ops[proto_id as usize] = Some(Rc::clone(&ops));
                Some(ops)
            }
            None => {
                warn!("no handler for proto {proto_id:#06x}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct NullOps;
    impl ProtoOps for NullOps {
        fn connect(&self, _: &mut Channel, _: &NodeInfo) -> Result<()> {
            Ok(())
        }
        fn inbound_packet(&self, _: &mut Channel, _: &[u8]) {}
        fn disconnect(&self, _: &mut Channel, _: &NodeInfo) {}
    }

    struct CountingDiscovery {
        loads: Rc<Cell<u32>>,
    }
    impl HandlerDiscovery for CountingDiscovery {
        fn load(&self, proto_id: u16) -> Option<Rc<dyn ProtoOps>> {
            self.loads.set(self.loads.get() + 1);
            (proto_id == 0x42).then(|| Rc::new(NullOps) as Rc<dyn ProtoOps>)
        }
    }

    #[test]
    fn discovery_result_is_memoized() {
        let loads = Rc::new(Cell::new(0));
        let mut reg = ProtoRegistry::new(Box::new(CountingDiscovery {
            loads: Rc::clone(&loads),
        }));
        assert!(reg.resolve(0x42).is_some());
        assert!(reg.resolve(0x42).is_some());
        assert_eq!(loads.get(), 1);
    }

    #[test]
    fn unknown_proto_resolves_to_none() {
        let loads = Rc::new(Cell::new(0));
        let mut reg = ProtoRegistry::new(Box::new(CountingDiscovery {
            loads: Rc::clone(&loads),
        }));
        assert!(reg.resolve(0x43).is_none());
        assert!(reg.resolve(0x2000).is_none()); // beyond the 13-bit space
    }

    #[test]
    fn static_registration_wins_over_discovery() {
        let loads = Rc::new(Cell::new(0));
        let mut reg = ProtoRegistry::new(Box::new(CountingDiscovery {
            loads: Rc::clone(&loads),
        }));
        reg.register(0x10, Rc::new(NullOps)).unwrap();
        assert!(reg.resolve(0x10).is_some());
        assert_eq!(loads.get(), 0);
    }
}
