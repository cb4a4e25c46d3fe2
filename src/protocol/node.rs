// LININOIO ETHERD — NODE/CHANNEL ARENA
// Fixed-capacity slot map of associated nodes. Handles carry a generation
// counter so a handle outliving its node (timer token, backend link) can
// never reach a reused slot. Capacity is fixed at startup: a full pool
// silently drops new association requests, peers retry.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::engine::timer::TimerHandle;
use crate::protocol::handler::ProtoOps;
use crate::protocol::wire::{MAX_NCHANNELS, MAX_NCORES, NAME_LEN};

/// Node slot count. Caps concurrent associated peers by design.
pub const MAX_NODES: usize = 7;

/// Link-layer source address a node associated from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkAddr(pub [u8; 6]);

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Read-only node identity passed to handler hooks.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub name: String,
    pub addr: LinkAddr,
}

/// One logical data stream within a node, bound to exactly one core.
pub struct Channel {
    pub id: u8,
    pub proto_id: u16,
    pub core_id: u8,
    pub ops: Option<Rc<dyn ProtoOps>>,
    /// Association-data payload returned to the peer. Empty by default;
    /// connect may replace it. Capped at the 12-bit wire length.
    pub adata: Vec<u8>,
    /// Handler-supplied firmware resource blob for this channel.
    pub resources: Vec<u8>,
    /// Handler private state, released with the channel.
    pub priv_data: Option<Box<dyn Any>>,
}

impl Channel {
    fn new(id: u8, core_id: u8, proto_id: u16) -> Self {
        Channel {
            id,
            proto_id,
            core_id,
            ops: None,
            adata: Vec::new(),
            resources: Vec::new(),
            priv_data: None,
        }
    }
}

/// One remote-processor instance attached to a node. Created lazily the
/// first time a channel references its core id.
pub struct Core {
    pub id: u8,
    /// `<node-name>-<core-index>`, also the processor name registered with
    /// the control device.
    pub name: String,
    /// Channel ids belonging to this core, in creation order.
    pub channels: Vec<u8>,
}

pub struct Node {
    pub name: String,
    pub addr: LinkAddr,
    pub alive: Option<TimerHandle>,
    pub nchannels: u8,
    channels: [Option<Channel>; MAX_NCHANNELS],
    cores: [Option<Core>; MAX_NCORES],
}

impl Node {
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            addr: self.addr,
        }
    }

    /// Core for `core_id`, created on first reference.
    pub fn ensure_core(&mut self, core_id: u8) -> &mut Core {
        let slot = &mut self.cores[core_id as usize];
        slot.get_or_insert_with(|| Core {
            id: core_id,
            name: format!("{}-{}", self.name, core_id),
            channels: Vec::new(),
        })
    }

    pub fn core(&self, core_id: u8) -> Option<&Core> {
        self.cores.get(core_id as usize)?.as_ref()
    }

    /// Cores in id order, skipping absent slots.
    pub fn cores(&self) -> impl Iterator<Item = &Core> {
        self.cores.iter().filter_map(|c| c.as_ref())
    }

    /// Create channel `id` bound to `core_id`. Caller guarantees ids are
    /// assigned sequentially within the association, so uniqueness holds.
    pub fn add_channel(&mut self, id: u8, core_id: u8, proto_id: u16) -> &mut Channel {
        self.ensure_core(core_id).channels.push(id);
        let slot = &mut self.channels[id as usize];
        debug_assert!(slot.is_none());
        slot.insert(Channel::new(id, core_id, proto_id))
    }

    pub fn channel(&self, id: u8) -> Option<&Channel> {
        self.channels.get(id as usize)?.as_ref()
    }

    pub fn channel_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.channels.get_mut(id as usize)?.as_mut()
    }

    /// Detach a channel for teardown.
    pub fn take_channel(&mut self, id: u8) -> Option<Channel> {
        self.channels.get_mut(id as usize)?.take()
    }
}

/// Stable reference to an arena slot. Indices only, never raw references;
/// generation mismatch after a release makes the handle inert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeHandle {
    slot: usize,
    gen: u32,
}

struct Slot {
    gen: u32,
    node: Option<Node>,
}

pub struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl NodeArena {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_NODES);
        let mut free = Vec::with_capacity(MAX_NODES);
        for i in 0..MAX_NODES {
            slots.push(Slot { gen: 0, node: None });
            free.push(MAX_NODES - 1 - i);
        }
        NodeArena { slots, free }
    }

    /// Pop a free slot and reset it for a new association. `None` when the
    /// pool is exhausted; the caller drops the request, it is not an error.
    pub fn allocate(&mut self, addr: LinkAddr, name: &str) -> Option<NodeHandle> {
        let slot = self.free.pop()?;
        let s = &mut self.slots[slot];
        debug_assert!(s.node.is_none());
        let name = if name.len() >= NAME_LEN {
            // Clamp on a char boundary: the wire field is raw bytes and a
            // lossy decode can put a multibyte char across the cut.
            let mut end = NAME_LEN - 1;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            &name[..end]
        } else {
            name
        };
        s.node = Some(Node {
            name: name.to_owned(),
            addr,
            alive: None,
            nchannels: 0,
            channels: Default::default(),
            cores: Default::default(),
        });
        Some(NodeHandle { slot, gen: s.gen })
    }

    pub fn get(&self, h: NodeHandle) -> Option<&Node> {
        let s = self.slots.get(h.slot)?;
        if s.gen != h.gen {
            return None;
        }
        s.node.as_ref()
    }

    pub fn get_mut(&mut self, h: NodeHandle) -> Option<&mut Node> {
        let s = self.slots.get_mut(h.slot)?;
        if s.gen != h.gen {
            return None;
        }
        s.node.as_mut()
    }

    /// Linear scan over active nodes, keyed on the association-time link
    /// address. Pool is 7 entries, a scan is fine.
    pub fn find_by_address(&self, addr: &LinkAddr) -> Option<NodeHandle> {
        self.slots.iter().enumerate().find_map(|(slot, s)| {
            let node = s.node.as_ref()?;
            (node.addr == *addr).then_some(NodeHandle { slot, gen: s.gen })
        })
    }

    /// Return a node to the free pool. Caller has already torn down its
    /// channels and cores. Bumps the generation so stale handles go inert.
    pub fn release(&mut self, h: NodeHandle) -> Option<Node> {
        let s = self.slots.get_mut(h.slot)?;
        if s.gen != h.gen {
            return None;
        }
        let node = s.node.take()?;
        s.gen = s.gen.wrapping_add(1);
        self.free.push(h.slot);
        Some(node)
    }

    pub fn active(&self) -> usize {
        MAX_NODES - self.free.len()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr([2, 0, 0, 0, 0, last])
    }

    #[test]
    fn pool_capacity_is_fixed() {
        let mut arena = NodeArena::new();
        let handles: Vec<_> = (0..MAX_NODES as u8)
            .map(|i| arena.allocate(addr(i), "n").unwrap())
            .collect();
        assert!(arena.allocate(addr(99), "overflow").is_none());
        assert_eq!(arena.active(), MAX_NODES);
        arena.release(handles[3]).unwrap();
        assert!(arena.allocate(addr(100), "reuse").is_some());
    }

    #[test]
    fn stale_handle_goes_inert_after_release() {
        let mut arena = NodeArena::new();
        let h = arena.allocate(addr(1), "a").unwrap();
        arena.release(h).unwrap();
        assert!(arena.get(h).is_none());
        assert!(arena.release(h).is_none()); // no double free
        let h2 = arena.allocate(addr(1), "b").unwrap();
        // Same slot, new generation: the old handle must not see the new node.
        assert!(arena.get(h).is_none());
        assert_eq!(arena.get(h2).unwrap().name, "b");
    }

    #[test]
    fn find_by_address_sees_only_active_nodes() {
        let mut arena = NodeArena::new();
        let h = arena.allocate(addr(7), "n7").unwrap();
        assert_eq!(arena.find_by_address(&addr(7)), Some(h));
        assert!(arena.find_by_address(&addr(8)).is_none());
        arena.release(h);
        assert!(arena.find_by_address(&addr(7)).is_none());
    }

    #[test]
    fn cores_created_lazily_and_channels_ordered() {
        let mut arena = NodeArena::new();
        let h = arena.allocate(addr(1), "yun").unwrap();
        let node = arena.get_mut(h).unwrap();
        node.add_channel(0, 2, 0x0002);
        node.add_channel(1, 2, 0x0001);
        node.add_channel(2, 0, 0x0001);
        let core2 = node.core(2).unwrap();
        assert_eq!(core2.name, "yun-2");
        assert_eq!(core2.channels, vec![0, 1]);
        assert_eq!(node.core(0).unwrap().channels, vec![2]);
        assert!(node.core(1).is_none());
        assert_eq!(node.cores().count(), 2);
    }

    #[test]
    fn long_names_are_clamped() {
        let mut arena = NodeArena::new();
        let h = arena
            .allocate(addr(1), "a-very-long-node-name-indeed")
            .unwrap();
        assert!(arena.get(h).unwrap().name.len() < NAME_LEN);
    }

    #[test]
    fn multibyte_names_clamp_on_char_boundaries() {
        let mut arena = NodeArena::new();
        // 8 x 2-byte chars = 16 bytes; byte 15 falls inside the last char.
        let h = arena.allocate(addr(1), "αααααααα").unwrap();
        let name = &arena.get(h).unwrap().name;
        assert_eq!(name, "ααααααα");
        assert!(name.len() < NAME_LEN);
        // lossy-decoded garbage expands to 3-byte U+FFFD chars
        let garbage = String::from_utf8_lossy(&[0xffu8; NAME_LEN]).into_owned();
        let h2 = arena.allocate(addr(2), &garbage).unwrap();
        assert!(arena.get(h2).unwrap().name.len() < NAME_LEN);
    }
}
