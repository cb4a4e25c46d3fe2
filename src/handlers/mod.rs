// LININOIO ETHERD — BUILT-IN PROTOCOL HANDLERS

pub mod console;
pub mod mcuio;

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::protocol::handler::{HandlerDiscovery, ProtoOps, HANDLER_CLASS};
use crate::protocol::wire::{PROTO_CONSOLE, PROTO_MCUIO_V0};

/// Discovery over a fixed table built at startup. The daemon links its
/// handlers in; there is no runtime module loading.
pub struct StaticDiscovery {
    table: HashMap<u16, Rc<dyn ProtoOps>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        StaticDiscovery {
            table: HashMap::new(),
        }
    }

    pub fn add(&mut self, proto_id: u16, ops: Rc<dyn ProtoOps>) {
        self.table.insert(proto_id, ops);
    }
}

impl HandlerDiscovery for StaticDiscovery {
    fn load(&self, proto_id: u16) -> Option<Rc<dyn ProtoOps>> {
        self.table.get(&proto_id).map(Rc::clone)
    }
}

/// The handler set compiled into the daemon.
pub fn builtin_discovery() -> StaticDiscovery {
    debug!("registering {HANDLER_CLASS} modules");
    let mut d = StaticDiscovery::new();
    d.add(PROTO_CONSOLE, Rc::new(console::ConsoleHandler));
    d.add(
        PROTO_MCUIO_V0,
        Rc::new(mcuio::McuioHandler::new(mcuio::MCUIOD_SOCKET_PATH)),
    );
    d
}
