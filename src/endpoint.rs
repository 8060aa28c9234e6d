//! Endpoint state for the connection-establishment machinery.
//!
//! An endpoint is either a dialer working toward one remote address or a
//! listener queueing connection requests for `accept`. The two modes are
//! a tagged variant; the frame handling that needs to transmit lives in
//! the node core, which owns the overlay.

use crate::addr::{Address, NetworkId};
use crate::error::Error;
use crate::pipe::PingCfg;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// The listen backlog capacity. A ring at capacity drops new connection
/// requests silently; the dialer's retransmit covers the loss.
pub(crate) const LISTEN_QUEUE: usize = 128;

/// How long an accepted-but-unpaired connection request stays usable, in
/// milliseconds.
pub(crate) const LISTEN_EXPIRE_MS: u64 = 60_000;

/// A completion slot for a user operation waiting on a pipe: connect and
/// accept both finish with the new pipe's local address, from which the
/// caller builds the user-facing handle.
#[derive(Debug)]
pub(crate) struct PipeWaiter {
    pub id: u64,
    pub tx: oneshot::Sender<Result<Address, Error>>,
}

#[derive(Debug)]
pub(crate) struct EndpointState {
    pub nwid: NetworkId,
    pub laddr: Address,
    /// The SP protocol this side speaks.
    pub sp_proto: u16,
    /// The SP protocol acceptable from the peer.
    pub sp_peer: u16,
    pub recv_max: u32,
    /// Largest virtual frame the joined network carries; learned from the
    /// network configuration.
    pub mtu: u32,
    /// Keepalive settings inherited by pipes this endpoint produces.
    pub ping: PingCfg,
    pub mode: Mode,
}

#[derive(Debug)]
pub(crate) enum Mode {
    Dial(DialState),
    Listen(ListenState),
}

impl EndpointState {
    pub fn dial(&mut self) -> Option<&mut DialState> {
        match &mut self.mode {
            Mode::Dial(state) => Some(state),
            Mode::Listen(_) => None,
        }
    }

    pub fn listen(&mut self) -> Option<&mut ListenState> {
        match &mut self.mode {
            Mode::Listen(state) => Some(state),
            Mode::Dial(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DialState {
    /// The remote address being dialed.
    pub raddr: Address,
    /// Connection requests sent so far for the waiting connect; zero when
    /// no connect is in flight.
    pub attempt: u32,
    pub waiter: Option<PipeWaiter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BacklogEntry {
    pub raddr: Address,
    pub sp_proto: u16,
    pub expires_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ListenState {
    pub backlog: VecDeque<BacklogEntry>,
    pub waiters: VecDeque<PipeWaiter>,
}

impl ListenState {
    /// Queues a connection request. Duplicates of a queued request are
    /// absorbed and a full ring drops the request silently; either way
    /// the peer's retransmit timer owns recovery.
    pub fn push_backlog(&mut self, now_ms: u64, raddr: Address, sp_proto: u16) {
        if self.backlog.iter().any(|entry| entry.raddr == raddr) {
            return;
        }
        if self.backlog.len() >= LISTEN_QUEUE {
            tracing::debug!(%raddr, "listen backlog full, dropping connection request");
            return;
        }
        self.backlog.push_back(BacklogEntry {
            raddr,
            sp_proto,
            expires_ms: now_ms + LISTEN_EXPIRE_MS,
        });
    }

    /// Pops the next usable backlog entry, discarding expired ones.
    pub fn pop_live(&mut self, now_ms: u64) -> Option<BacklogEntry> {
        while let Some(entry) = self.backlog.pop_front() {
            if entry.expires_ms > now_ms {
                return Some(entry);
            }
            tracing::debug!(raddr = %entry.raddr, "discarding expired backlog entry");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::NodeId;

    fn raddr(port: u32) -> Address {
        Address::new(NodeId::new(0x42), port)
    }

    #[test]
    fn backlog_deduplicates_by_remote() {
        let mut listen = ListenState::default();
        listen.push_backlog(0, raddr(1), 16);
        listen.push_backlog(0, raddr(1), 16);
        listen.push_backlog(0, raddr(2), 16);
        assert_eq!(listen.backlog.len(), 2);
    }

    #[test]
    fn backlog_caps_at_queue_size() {
        let mut listen = ListenState::default();
        for port in 1..=(LISTEN_QUEUE as u32 + 10) {
            listen.push_backlog(0, raddr(port), 16);
        }
        assert_eq!(listen.backlog.len(), LISTEN_QUEUE);
        // The overflow requests were the ones dropped.
        assert!(listen
            .backlog
            .iter()
            .all(|entry| entry.raddr.port() <= LISTEN_QUEUE as u32));
    }

    #[test]
    fn expired_entries_are_never_delivered() {
        let mut listen = ListenState::default();
        listen.push_backlog(0, raddr(1), 16);
        listen.push_backlog(LISTEN_EXPIRE_MS / 2, raddr(2), 16);
        // Entry 1 has expired by now; entry 2 has not.
        let popped = listen.pop_live(LISTEN_EXPIRE_MS + 1).unwrap();
        assert_eq!(popped.raddr, raddr(2));
        assert!(listen.pop_live(LISTEN_EXPIRE_MS + 1).is_none());
    }

    #[test]
    fn pop_live_drains_in_arrival_order() {
        let mut listen = ListenState::default();
        listen.push_backlog(0, raddr(1), 16);
        listen.push_backlog(0, raddr(2), 16);
        assert_eq!(listen.pop_live(1).unwrap().raddr, raddr(1));
        assert_eq!(listen.pop_live(1).unwrap().raddr, raddr(2));
        assert!(listen.pop_live(1).is_none());
    }
}
