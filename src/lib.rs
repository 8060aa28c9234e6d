//! A reliable, connection-oriented message transport layered on a
//! connectionless virtual-L2 overlay network.
//!
//! The overlay (a ZeroTier-style network running over UDP) owns node
//! identity, network membership, encryption, and path selection. This crate
//! owns everything above it: 64-bit transport addresses and port
//! allocation, the connection-establishment handshake, fragmentation and
//! reassembly of application messages across a bounded MTU, and the
//! per-node machinery that services the overlay's callbacks. The result is
//! a bidirectional, best-effort pipe abstraction suitable for a
//! Scalability-Protocols messaging layer: messages are atomic and
//! reassembled in full, but no ordering is guaranteed between messages.
//!
//! # Organization
//!
//! - [`Message`] is the byte container used for payloads on both the send
//!   and receive paths.
//! - [`Dialer`] and [`Listener`] are the user-facing endpoints; both yield
//!   [`Pipe`]s once a connection is established.
//! - [`overlay`] defines the contract with the external overlay library
//!   and ships [`MemoryNet`], an in-process stand-in good enough for local
//!   networks and tests.
//!
//! # Addressing
//!
//! A transport address packs a 40-bit overlay node id and a 24-bit port
//! into a `u64`. Ports at or above `0x800000` are ephemeral and allocated
//! from a randomly seeded cursor; lower ports are claimed explicitly by
//! listeners. URL form: `zt://<nwid>/<node>:<port>`, with `*` accepted as
//! the local node for listeners.

pub mod addr;
pub mod error;
pub mod frame;
pub mod message;
pub mod overlay;
pub mod pipe;
pub mod transport;
pub mod url;

mod endpoint;
mod node;
mod reassembly;

pub use addr::{Address, NetworkId, NodeId, Port};
pub use error::Error;
pub use message::Message;
pub use overlay::memory::MemoryNet;
pub use overlay::{Overlay, OverlayFactory, OverlayHost};
pub use pipe::Pipe;
pub use transport::{Dialer, Listener, Options};
pub use url::ZtUrl;

use dashmap::DashMap;
use std::hash::BuildHasherDefault;
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
