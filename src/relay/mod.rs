//! Splits the transport across two hosts: the radio host serves the GATT
//! characteristics and forwards each operation over a persistent WebSocket to
//! the verifier host, which answers from its [`ServerContext`].
//!
//! [`ServerContext`]: crate::context::ServerContext

pub mod protocol;
pub mod radio;
pub mod verifier;

pub use protocol::{Inbound, Notice, RelayAction, RelayRequest, RelayResponse};
pub use radio::{RelayClient, RelayClientConfig};
pub use verifier::RelayHub;
