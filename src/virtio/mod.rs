// LININOIO ETHERD — VIRTIO BACKEND
// Host-side view of the virtqueues a started core exposes through its
// r2proc backend devices.

pub mod vring;
pub mod backend;
