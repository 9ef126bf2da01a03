//! burrow-core — wire format, cryptographic primitives, replay window,
//! shaper math and configuration. The burrowd daemon depends on this crate.

pub mod config;
pub mod crypto;
pub mod replay;
pub mod shaper;
pub mod wire;

pub use config::{BurrowConfig, PeerConf};
pub use crypto::{PeerId, SessionKey};
