// LININOIO ETHERD — PROTOCOL LAYER
// Wire format, protocol handler registry, node/channel arena.

pub mod wire;
pub mod handler;
pub mod node;
