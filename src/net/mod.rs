// LININOIO ETHERD — NET
// AF_PACKET transport and the protocol engine driven by it.

pub mod ether;
