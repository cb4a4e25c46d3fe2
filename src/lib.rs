// LININOIO ETHERD — CRATE ROOT (LIBRARY)
// Userspace side of the lininoio link: associates ethernet-attached MCU
// nodes, hands their channels to protocol handlers, and bridges each remote
// core to the kernel r2proc framework (firmware image + virtqueue backend).
//
// Module hierarchy:
//   protocol/ — Wire format, handler registry, node/channel arena
//   engine/   — Alive timer queue, poll(2) readiness multiplexer
//   net/      — AF_PACKET transport, association machine, data path
//   rproc/    — Firmware image assembly, r2proc control device
//   virtio/   — Backend device bridge, bounds-checked vring view
//   handlers/ — Built-in protocol handlers (console, mcuio)
//
// main.rs (binary crate `etherd`) owns the CLI, daemonization and the
// top-level event loop that wires these together.

pub mod error;
pub mod logger;
pub mod protocol;
pub mod engine;
pub mod net;
pub mod rproc;
pub mod virtio;
pub mod hotplug;
pub mod handlers;

pub use error::Error;
