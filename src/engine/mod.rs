// LININOIO ETHERD — ENGINE
// Single-threaded readiness plumbing: timer queue + poll(2) multiplexer.

pub mod timer;
pub mod poll;
