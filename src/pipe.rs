//! The user-facing pipe and its engine state.
//!
//! A pipe is one established connection between two transport addresses.
//! Sends are segmented into data frames and handed to the overlay
//! synchronously; receives park a single waiter on the pipe until the
//! reassembler completes a message. Closing (or dropping) a pipe fails
//! the pending read, tells the peer best-effort, and removes the pipe
//! from every node index.

use crate::addr::{Address, NetworkId, NodeId};
use crate::error::Error;
use crate::message::Message;
use crate::node::{now_ms, NodeShared};
use crate::reassembly::Reassembly;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Keepalive configuration, per pipe. A zero interval disables pings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PingCfg {
    pub interval_ms: u64,
    pub max_misses: u32,
}

#[derive(Debug)]
pub(crate) struct ReadWaiter {
    pub id: u64,
    pub tx: oneshot::Sender<Result<Message, Error>>,
}

#[derive(Debug)]
pub(crate) struct PipeState {
    pub nwid: NetworkId,
    pub laddr: Address,
    pub raddr: Address,
    pub sp_proto: u16,
    pub peer_proto: u16,
    pub peer_mtu: u32,
    pub recv_max: u32,
    /// The next outgoing message id; wraps past zero, which is reserved.
    pub next_msg_id: u16,
    pub pending_read: Option<ReadWaiter>,
    pub reassembly: Reassembly,
    pub ping: PingCfg,
    pub pings_outstanding: u32,
    pub next_ping_ms: u64,
}

impl PipeState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nwid: NetworkId,
        laddr: Address,
        raddr: Address,
        sp_proto: u16,
        peer_proto: u16,
        peer_mtu: u32,
        recv_max: u32,
        ping: PingCfg,
        now_ms: u64,
    ) -> Self {
        Self {
            nwid,
            laddr,
            raddr,
            sp_proto,
            peer_proto,
            peer_mtu,
            recv_max,
            next_msg_id: 1,
            pending_read: None,
            reassembly: Reassembly::new(),
            ping,
            pings_outstanding: 0,
            next_ping_ms: now_ms.saturating_add(ping.interval_ms),
        }
    }

    /// Takes the next message id, skipping zero on wraparound.
    pub fn take_msg_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    /// Notes that the peer showed signs of life.
    pub fn mark_alive(&mut self, now_ms: u64) {
        self.pings_outstanding = 0;
        self.next_ping_ms = now_ms.saturating_add(self.ping.interval_ms);
    }
}

/// One end of an established connection.
///
/// Messages are atomic: a send of N bytes is received as exactly one
/// N-byte message or not at all, with no ordering guarantee between
/// messages. Dropping the pipe closes it.
pub struct Pipe {
    node: Arc<NodeShared>,
    laddr: Address,
    nwid: NetworkId,
    raddr: Address,
    sp_proto: u16,
    peer_proto: u16,
    peer_mtu: u32,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("laddr", &self.laddr)
            .field("raddr", &self.raddr)
            .finish()
    }
}

impl Pipe {
    /// Builds the user handle for an established pipe, caching the facts
    /// that must survive close.
    pub(crate) fn attach(node: Arc<NodeShared>, laddr: Address) -> Result<Pipe, Error> {
        let core = node.core.lock().expect("node lock");
        let state = core.pipes.get(&laddr).ok_or(Error::Closed)?;
        let (laddr, nwid, raddr, sp_proto, peer_proto, peer_mtu) = (
            state.laddr,
            state.nwid,
            state.raddr,
            state.sp_proto,
            state.peer_proto,
            state.peer_mtu,
        );
        drop(core);
        // The keepalive schedule changed; let the worker recompute it.
        node.poke_background();
        Ok(Pipe {
            node,
            laddr,
            nwid,
            raddr,
            sp_proto,
            peer_proto,
            peer_mtu,
        })
    }

    /// Sends one message to the peer, best-effort.
    ///
    /// The message is segmented to the peer's MTU and handed to the
    /// overlay before this returns; delivery is not acknowledged. Fails
    /// with [`Error::MsgSize`] if the message cannot be expressed in the
    /// fragment count the wire format allows, and [`Error::Closed`] once
    /// the pipe is closed.
    pub async fn send(&self, message: impl Into<Message>) -> Result<(), Error> {
        let message = message.into();
        let now = now_ms();
        let mut core = self.node.core.lock().expect("node lock");
        let result = core.pipe_send(now, self.laddr, message);
        core.drain(now);
        result
    }

    /// Receives the next complete message.
    ///
    /// At most one receive may wait at a time; a second concurrent call
    /// fails with [`Error::Busy`]. Dropping the returned future
    /// relinquishes the pending-read slot.
    pub async fn recv(&self) -> Result<Message, Error> {
        let (id, mut rx) = {
            let mut core = self.node.core.lock().expect("node lock");
            let id = core.next_op_id();
            let state = core.pipes.get_mut(&self.laddr).ok_or(Error::Closed)?;
            if let Some(message) = state.reassembly.take_ready() {
                return Ok(message);
            }
            if state.pending_read.is_some() {
                return Err(Error::Busy);
            }
            let (tx, rx) = oneshot::channel();
            state.pending_read = Some(ReadWaiter { id, tx });
            (id, rx)
        };
        let mut guard = RecvGuard {
            node: Arc::clone(&self.node),
            laddr: self.laddr,
            id,
            armed: true,
        };
        let received = (&mut rx).await;
        guard.armed = false;
        match received {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Closes the pipe: the pending read (if any) fails with
    /// [`Error::Closed`], the peer is told best-effort, and the pipe
    /// leaves the node's indexes. Idempotent.
    pub fn close(&self) {
        let now = now_ms();
        let mut core = self.node.core.lock().expect("node lock");
        core.close_pipe(now, self.laddr, Error::Closed, true);
        core.drain(now);
    }

    pub fn local_addr(&self) -> Address {
        self.laddr
    }

    pub fn remote_addr(&self) -> Address {
        self.raddr
    }

    pub fn network_id(&self) -> NetworkId {
        self.nwid
    }

    pub fn node_id(&self) -> NodeId {
        self.laddr.node()
    }

    pub fn sp_protocol(&self) -> u16 {
        self.sp_proto
    }

    pub fn peer_sp_protocol(&self) -> u16 {
        self.peer_proto
    }

    /// Largest virtual frame the peer's network carries; fragment sizing
    /// is derived from this.
    pub fn peer_mtu(&self) -> u32 {
        self.peer_mtu
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clears the pending-read slot if its receive future is dropped before
/// completing.
struct RecvGuard {
    node: Arc<NodeShared>,
    laddr: Address,
    id: u64,
    armed: bool,
}

impl Drop for RecvGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut core = self.node.core.lock().expect("node lock");
        if let Some(state) = core.pipes.get_mut(&self.laddr) {
            if state
                .pending_read
                .as_ref()
                .map(|w| w.id == self.id)
                .unwrap_or(false)
            {
                state.pending_read = None;
            }
        }
    }
}
