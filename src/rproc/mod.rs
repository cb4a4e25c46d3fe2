// LININOIO ETHERD — REMOTEPROC BRIDGE
// Firmware image assembly and r2proc control-device registration.

pub mod firmware;
pub mod ctrl;
