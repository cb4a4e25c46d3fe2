// LININOIO ETHERD — ETHER TRANSPORT + ASSOCIATION MACHINE
// Receives lininoio frames on a raw AF_PACKET socket, classifies by packet
// type and drives either the association state machine or the data path.
// The engine owns the node arena, the handler registry and the alive timer
// queue; OS-facing collaborators (frame sink, remoteproc bridge) are passed
// in at the call seam so the whole machine runs hermetically under test.
//
// Association is synchronous within one AREQUEST: allocate a node, build
// its channels, reply. There is no intermediate persisted state.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::protocol::handler::ProtoRegistry;
use crate::protocol::node::{LinkAddr, NodeArena, NodeHandle};
use crate::protocol::wire::{self, Arequest, Packet, ETH_P_LININOIO, MAX_NCHANNELS};

/// Default per-node inactivity timeout before teardown.
pub const DEFAULT_ALIVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Receive buffer: a lininoio frame never exceeds one link MTU.
pub const RX_BUF_SIZE: usize = 1024;

type TimerQueue = crate::engine::timer::TimerQueue<NodeHandle>;

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// Outbound side of the link. `segments` are gathered into one datagram;
/// an AREPLY is the header segment plus one association-data segment per
/// channel, in channel-id order.
pub trait FrameSink {
    fn send(&mut self, to: &LinkAddr, segments: &[&[u8]]) -> io::Result<usize>;
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Side effects the engine asks its caller to perform. Remote-processor
/// setup is deliberately decoupled from the AREPLY status: a registration
/// failure aborts that core only, never the association (nor the daemon).
#[derive(Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// A successful association completed this core; build and register
    /// its firmware.
    CoreReady {
        node: NodeHandle,
        core_id: u8,
        core_name: String,
    },
    /// A node was torn down; drop its registrations and mapped backends.
    NodeDead {
        node: NodeHandle,
        core_names: Vec<String>,
    },
}

// ============================================================================
// PROTOCOL ENGINE
// ============================================================================

pub struct EtherEngine {
    arena: NodeArena,
    registry: ProtoRegistry,
    timers: TimerQueue,
    alive_timeout: Duration,
    events: Vec<EngineEvent>,
}

impl EtherEngine {
    pub fn new(registry: ProtoRegistry, alive_timeout: Duration) -> Self {
        EtherEngine {
            arena: NodeArena::new(),
            registry,
            timers: TimerQueue::new(),
            alive_timeout,
            events: Vec::new(),
        }
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Pending side effects, in emission order.
    pub fn take_events(&mut self) -> Vec<EngineEvent> {
        mem::take(&mut self.events)
    }

    /// Earliest alive deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Entry point for one received frame.
    pub fn handle_frame(
        &mut self,
        now: Instant,
        from: LinkAddr,
        frame: &[u8],
        sink: &mut dyn FrameSink,
    ) {
        match wire::decode(frame) {
            Ok(Packet::Arequest(rq)) => self.rx_arequest(now, from, &rq, sink),
            Ok(Packet::Data { chan_id, payload }) => self.rx_data(now, from, chan_id, payload),
            Ok(Packet::Areply { .. }) => warn!("unexpected AREPLY from {from:?}"),
            Err(e) => warn!("dropping frame from {from:?}: {e}"),
        }
    }

    fn rx_arequest(
        &mut self,
        now: Instant,
        from: LinkAddr,
        rq: &Arequest<'_>,
        sink: &mut dyn FrameSink,
    ) {
        if let Some(h) = self.arena.find_by_address(&from) {
            // Duplicate request: reply success with the current association
            // data and change nothing. Idempotent from the peer's side.
            warn!("association request from already associated {from:?}");
            if let Err(e) = self.send_areply(h, 0, sink) {
                error!("error resending association reply: {e}");
            }
            return;
        }
        let nchannels = rq.nchannels();
        if nchannels > MAX_NCHANNELS {
            warn!("association with invalid channel count {nchannels}, dropping");
            return;
        }
        let Some(h) = self.arena.allocate(from, &rq.name()) else {
            // Pool full: silently ignore, the peer retries.
            warn!("no more free nodes, dropping association from {from:?}");
            return;
        };
        let th = self.timers.schedule(now, self.alive_timeout, h);
        let info = {
            let node = self.arena.get_mut(h).expect("just allocated");
            node.alive = Some(th);
            node.nchannels = nchannels as u8;
            node.info()
        };
        info!(
            "association request from {} ({from:?}), {nchannels} channels, alive timeout {:?}",
            info.name, self.alive_timeout
        );

        let mut status: u8 = 0;
        if nchannels == 0 {
            error!("node {} requested no channels", info.name);
            status = 1;
        }
        for (i, descr) in rq.descriptors().enumerate() {
            let core_id = wire::cdescr_core_id(descr);
            let proto_id = wire::cdescr_proto_id(descr);
            // A missing handler is only a warning; the channel exists but
            // stays silent. A handler that refuses to connect is fatal to
            // the whole association.
            let ops = self.registry.resolve(proto_id);
            let node = self.arena.get_mut(h).expect("allocated above");
            let chan = node.add_channel(i as u8, core_id, proto_id);
            chan.ops = ops.clone();
            info!(
                "new channel {} for node {} (core {core_id}, proto {proto_id:#06x})",
                i, info.name
            );
            if let Some(ops) = ops {
                if let Err(e) = ops.connect(chan, &info) {
                    error!("connect failed for proto {proto_id:#06x}: {e}");
                    status = 1;
                    break;
                }
            }
        }

        if status == 0 {
            let ready: Vec<EngineEvent> = self
                .arena
                .get(h)
                .expect("allocated above")
                .cores()
                .map(|core| EngineEvent::CoreReady {
                    node: h,
                    core_id: core.id,
                    core_name: core.name.clone(),
                })
                .collect();
            self.events.extend(ready);
        }
        if let Err(e) = self.send_areply(h, status, sink) {
            error!("error sending association reply: {e}");
        }
        if status != 0 {
            // Abort atomically: disconnect whatever connected, release the
            // node. The timer is cancelled inside kill_node before release.
            self.kill_node(h);
        }
    }

    fn rx_data(&mut self, now: Instant, from: LinkAddr, chan_id: u8, payload: &[u8]) {
        let Some(h) = self.arena.find_by_address(&from) else {
            debug!("data packet from unknown {from:?}");
            return;
        };
        let node = self.arena.get_mut(h).expect("active handle");
        if node.channel(chan_id).is_none() {
            debug!("data packet to missing channel {chan_id}, ignoring");
            return;
        }
        // Traffic proves liveness: reschedule the alive timer.
        if let Some(th) = node.alive.take() {
            self.timers.cancel(th);
        }
        let th = self.timers.schedule(now, self.alive_timeout, h);
        self.arena.get_mut(h).expect("active handle").alive = Some(th);
        self.deliver_inbound(h, chan_id, payload);
    }

    /// Hand one payload to a channel's handler. Shared by the wire data
    /// path and the virtio backend bridge. Drops quietly when the handle is
    /// stale, the channel is absent or the channel has no ops.
    pub fn deliver_inbound(&mut self, h: NodeHandle, chan_id: u8, payload: &[u8]) {
        let Some(node) = self.arena.get_mut(h) else {
            return;
        };
        let Some(chan) = node.channel_mut(chan_id) else {
            return;
        };
        match chan.ops.clone() {
            Some(ops) => ops.inbound_packet(chan, payload),
            None => debug!("no handler for packet on channel {chan_id}"),
        }
    }

    /// Outbound DATA frame toward a node.
    pub fn send_data(
        &mut self,
        h: NodeHandle,
        chan_id: u8,
        payload: &[u8],
        sink: &mut dyn FrameSink,
    ) -> io::Result<usize> {
        let node = self
            .arena
            .get(h)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "stale node handle"))?;
        let frame = wire::data_frame(chan_id, payload);
        sink.send(&node.addr, &[&frame])
    }

    fn send_areply(&self, h: NodeHandle, status: u8, sink: &mut dyn FrameSink) -> io::Result<()> {
        let node = self
            .arena
            .get(h)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "stale node handle"))?;
        let hdr = wire::areply_header(status);
        let mut segs: Vec<Vec<u8>> = vec![hdr.to_vec()];
        if status == 0 {
            for id in 0..MAX_NCHANNELS as u8 {
                if let Some(c) = node.channel(id) {
                    segs.push(wire::adata_segment(c.id, &c.adata));
                }
            }
        }
        let refs: Vec<&[u8]> = segs.iter().map(|s| s.as_slice()).collect();
        sink.send(&node.addr, &refs)?;
        Ok(())
    }

    /// Fire expired alive timers. A handle whose node is already gone is
    /// inert, so teardown can never re-enter for the same node.
    pub fn run_timers(&mut self, now: Instant) {
        while let Some(h) = self.timers.pop_expired(now) {
            if let Some(node) = self.arena.get(h) {
                info!("alive timeout, killing node {}", node.name);
            }
            self.kill_node(h);
        }
    }

    /// Tear a node down: cancel its timer, run every channel's disconnect
    /// hook, announce the death, return the slot to the free pool. Inert on
    /// stale handles.
    pub fn kill_node(&mut self, h: NodeHandle) {
        let alive = match self.arena.get_mut(h) {
            Some(node) => node.alive.take(),
            None => return,
        };
        if let Some(th) = alive {
            self.timers.cancel(th);
        }
        let info = self.arena.get(h).expect("checked above").info();
        for id in 0..MAX_NCHANNELS as u8 {
            let chan = self.arena.get_mut(h).and_then(|n| n.take_channel(id));
            if let Some(mut chan) = chan {
                if let Some(ops) = chan.ops.clone() {
                    ops.disconnect(&mut chan, &info);
                }
            }
        }
        let core_names: Vec<String> = self
            .arena
            .get(h)
            .expect("checked above")
            .cores()
            .map(|c| c.name.clone())
            .collect();
        self.events.push(EngineEvent::NodeDead {
            node: h,
            core_names,
        });
        self.arena.release(h);
        info!("node {} released", info.name);
    }
}

// ============================================================================
// AF_PACKET SOCKET
// ============================================================================

const SIOCGIFINDEX: libc::c_ulong = 0x8933;

// libc's ifreq exposes the ifru union awkwardly across targets; the kernel
// ABI is stable, so carry our own view of the two fields we touch.
#[repr(C)]
struct IfreqIndex {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_ifindex: libc::c_int,
    _pad: [u8; 20],
}

fn sockaddr_ll(ifindex: libc::c_int, addr: Option<&LinkAddr>) -> libc::sockaddr_ll {
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::c_ushort;
    sll.sll_protocol = ETH_P_LININOIO.to_be();
    sll.sll_ifindex = ifindex;
    sll.sll_halen = 6;
    if let Some(a) = addr {
        sll.sll_addr[..6].copy_from_slice(&a.0);
    }
    sll
}

/// Raw link-layer socket bound to one interface and the lininoio ethertype.
/// SOCK_DGRAM: the kernel handles the ethernet header, we see payloads and
/// sockaddr_ll peer addresses.
pub struct EtherSocket {
    fd: OwnedFd,
    ifindex: libc::c_int,
}

impl EtherSocket {
    pub fn open(ifname: &str) -> io::Result<Self> {
        if ifname.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name is too long",
            ));
        }
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM,
                ETH_P_LININOIO.to_be() as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr: IfreqIndex = unsafe { mem::zeroed() };
        ifr.ifr_name[..ifname.len()].copy_from_slice(ifname.as_bytes());
        if unsafe { libc::ioctl(fd.as_raw_fd(), SIOCGIFINDEX, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let sll = sockaddr_ll(ifr.ifr_ifindex, None);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EtherSocket {
            fd,
            ifindex: ifr.ifr_ifindex,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// One frame payload plus the sender's link address.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, LinkAddr)> {
        let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut fromlen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut fromlen,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&from.sll_addr[..6]);
        Ok((n as usize, LinkAddr(mac)))
    }
}

impl FrameSink for EtherSocket {
    fn send(&mut self, to: &LinkAddr, segments: &[&[u8]]) -> io::Result<usize> {
        let dst = sockaddr_ll(self.ifindex, Some(to));
        let mut iovs: Vec<libc::iovec> = segments
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.as_ptr() as *mut libc::c_void,
                iov_len: s.len(),
            })
            .collect();
        let mut mhdr: libc::msghdr = unsafe { mem::zeroed() };
        mhdr.msg_name = &dst as *const libc::sockaddr_ll as *mut libc::c_void;
        mhdr.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        mhdr.msg_iov = iovs.as_mut_ptr();
        mhdr.msg_iovlen = iovs.len();
        let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &mhdr, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
