//! burrowd — user-space VPN daemon library.
//!
//! The binary in `main.rs` is a thin wrapper; everything lives here so the
//! integration tests can drive the datapath in-process.

pub mod device;
pub mod peer;
pub mod tap;
pub mod transport;
