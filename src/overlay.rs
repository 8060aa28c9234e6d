//! The contract between the transport engine and the overlay library.
//!
//! The overlay owns node identity, virtual-network membership, encryption,
//! and path selection; the engine only drives it and services its
//! callbacks. Because the overlay is not reentrant, every entry point
//! receives the host callback surface as an argument and is invoked with
//! the node's lock held; host callbacks therefore never block and never
//! call back into the overlay. Anything that needs the engine proper
//! (frame dispatch, configuration changes) is queued on the host and
//! drained by the engine after the overlay call returns, still under the
//! same lock.

pub mod memory;

use crate::addr::{Mac, NetworkId, NodeId};
use std::net::SocketAddr;
use thiserror::Error as ThisError;

/// What happened to a virtual network's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    /// The network came up; its configuration is now valid.
    Up,
    /// An updated configuration for a network that is already up.
    Update,
    /// The network went away.
    Down,
}

/// The subset of a network's configuration the transport cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub nwid: NetworkId,
    /// Largest virtual frame the network will carry.
    pub mtu: u32,
    /// Physical-path MTU underneath the overlay.
    pub phy_mtu: u32,
}

/// Object types the overlay may ask the host to persist.
///
/// Only identities and the planet map to files; the rest live in memory
/// for the lifetime of the node at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObject {
    IdentityPublic,
    IdentitySecret,
    Planet,
    Moon,
    Peer,
    Network,
}

impl StateObject {
    /// The file this object is stored under in a home directory, or
    /// `None` for object types that are never persisted.
    pub fn file_name(self) -> Option<&'static str> {
        match self {
            StateObject::IdentityPublic => Some("identity.public"),
            StateObject::IdentitySecret => Some("identity.secret"),
            StateObject::Planet => Some("planet"),
            StateObject::Moon | StateObject::Peer | StateObject::Network => None,
        }
    }
}

/// Informational overlay events. These must not alter engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    Up,
    Online,
    Offline,
    Down,
    Trace(String),
}

#[derive(Debug, ThisError)]
pub enum OverlayError {
    /// A recoverable failure: the affected packet or frame is dropped and
    /// the engine carries on.
    #[error("transient overlay failure: {0}")]
    Transient(String),
    /// The overlay is wedged; the node must shut down.
    #[error("fatal overlay failure: {0}")]
    Fatal(String),
}

/// The callback surface the engine provides to the overlay.
pub trait OverlayHost {
    /// Hands the overlay's encrypted packet to UDP. Non-blocking and
    /// best-effort: failures drop the packet.
    fn wire_send(&mut self, dest: SocketAddr, packet: &[u8]);

    /// Delivers a decrypted virtual-L2 frame for the local node. The host
    /// queues it; the engine dispatches after the overlay call returns.
    fn virtual_frame(
        &mut self,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    );

    /// Reports a network coming up, changing, or going away.
    fn network_config(&mut self, op: ConfigOp, config: NetworkConfig);

    /// Persists an overlay object, replacing any previous value whole.
    fn state_put(&mut self, object: StateObject, data: &[u8]);

    /// Reads back a persisted object. Returns `None` if the object is
    /// absent or larger than `limit` bytes.
    fn state_get(&mut self, object: StateObject, limit: usize) -> Option<Vec<u8>>;

    /// An informational event; hosts may log it and nothing else.
    fn event(&mut self, event: OverlayEvent);
}

/// The external overlay library, as consumed by the engine.
///
/// All methods are called with the node lock held and must not block.
/// Times are monotonic milliseconds.
pub trait Overlay: Send {
    /// This node's overlay identity.
    fn node_id(&self) -> NodeId;

    /// Joins a virtual network. The overlay reports the network's
    /// configuration through [`OverlayHost::network_config`], immediately
    /// or once membership is established.
    fn join(&mut self, host: &mut dyn OverlayHost, nwid: NetworkId) -> Result<(), OverlayError>;

    /// Leaves a virtual network.
    fn leave(&mut self, host: &mut dyn OverlayHost, nwid: NetworkId) -> Result<(), OverlayError>;

    /// Feeds one received UDP packet through the overlay. Decrypted
    /// frames for this node come back via [`OverlayHost::virtual_frame`];
    /// relayed traffic goes back out via [`OverlayHost::wire_send`].
    fn process_wire_packet(
        &mut self,
        host: &mut dyn OverlayHost,
        now_ms: u64,
        source: SocketAddr,
        packet: &[u8],
    ) -> Result<(), OverlayError>;

    /// Sends one virtual-L2 frame toward a peer, best-effort.
    fn send_virtual_frame(
        &mut self,
        host: &mut dyn OverlayHost,
        now_ms: u64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<(), OverlayError>;

    /// Runs the overlay's periodic housekeeping and returns the next
    /// desired wakeup time in monotonic milliseconds.
    fn process_background_tasks(
        &mut self,
        host: &mut dyn OverlayHost,
        now_ms: u64,
    ) -> Result<u64, OverlayError>;
}

/// Creates overlay instances, one per node.
///
/// The factory is handed the host so the overlay can load its identity
/// through [`OverlayHost::state_get`] before the node finishes coming up.
pub trait OverlayFactory: Send + Sync {
    fn open(&self, host: &mut dyn OverlayHost) -> Result<Box<dyn Overlay>, OverlayError>;
}
