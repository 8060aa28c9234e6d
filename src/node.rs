//! The per-node manager: one overlay instance, its UDP sockets, the
//! demultiplexing indexes, and the background worker.
//!
//! A node exists per home directory; endpoints naming the same home share
//! it. All mutable node state, the overlay included, sits behind one lock
//! because the overlay is not reentrant. Overlay callbacks run under that
//! lock and only queue work; [`NodeCore::drain`] dispatches the queued
//! virtual frames and configuration events afterwards, still under the
//! same lock, so a dispatch that replies through the overlay never nests
//! inside another overlay call.

mod ports;
mod state;

use crate::addr::{self, Address, NetworkId, NodeId, Port};
use crate::endpoint::{DialState, EndpointState, Mode, PipeWaiter};
use crate::error::Error;
use crate::frame::{self, Body, ErrorCode, Opcode};
use crate::message::Message;
use crate::overlay::{
    ConfigOp, NetworkConfig, Overlay, OverlayError, OverlayEvent, OverlayFactory, OverlayHost,
    StateObject,
};
use crate::pipe::PipeState;
use crate::FxDashMap;
use ports::{PortOwner, PortRegistry};
use rustc_hash::FxHashMap;
use state::StateStore;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Receive buffer size per socket; comfortably larger than any overlay
/// MTU plus encapsulation overhead.
const RECV_BUFFER: usize = 64 * 1024;

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the first call in this process.
pub(crate) fn now_ms() -> u64 {
    start_instant().elapsed().as_millis() as u64
}

fn instant_at(ms: u64) -> tokio::time::Instant {
    tokio::time::Instant::from_std(start_instant() + Duration::from_millis(ms))
}

#[derive(Default)]
struct NodeSignals {
    shutdown: Notify,
    background: Notify,
}

/// A decrypted virtual frame queued for dispatch.
pub(crate) struct InboundFrame {
    pub nwid: NetworkId,
    pub src_mac: addr::Mac,
    pub dst_mac: addr::Mac,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

/// The callback surface handed to the overlay. Everything here either
/// completes immediately without blocking or queues for the engine.
pub(crate) struct HostState {
    udp4: Option<Arc<UdpSocket>>,
    udp6: Option<Arc<UdpSocket>>,
    state: StateStore,
    inbox: VecDeque<InboundFrame>,
    config_events: VecDeque<(ConfigOp, NetworkConfig)>,
}

impl OverlayHost for HostState {
    fn wire_send(&mut self, dest: SocketAddr, packet: &[u8]) {
        let socket = match dest {
            SocketAddr::V4(_) => self.udp4.as_ref(),
            SocketAddr::V6(_) => self.udp6.as_ref(),
        };
        match socket {
            Some(socket) => {
                if let Err(error) = socket.try_send_to(packet, dest) {
                    tracing::trace!(%error, %dest, "udp send dropped a packet");
                }
            }
            None => tracing::trace!(%dest, "no socket for address family"),
        }
    }

    fn virtual_frame(
        &mut self,
        nwid: NetworkId,
        src_mac: addr::Mac,
        dst_mac: addr::Mac,
        ethertype: u16,
        payload: &[u8],
    ) {
        self.inbox.push_back(InboundFrame {
            nwid,
            src_mac,
            dst_mac,
            ethertype,
            payload: payload.to_vec(),
        });
    }

    fn network_config(&mut self, op: ConfigOp, config: NetworkConfig) {
        self.config_events.push_back((op, config));
    }

    fn state_put(&mut self, object: StateObject, data: &[u8]) {
        self.state.put(object, data);
    }

    fn state_get(&mut self, object: StateObject, limit: usize) -> Option<Vec<u8>> {
        self.state.get(object, limit)
    }

    fn event(&mut self, event: OverlayEvent) {
        tracing::debug!(?event, "overlay event");
    }
}

#[derive(Debug)]
struct NetworkState {
    refs: u32,
    up: bool,
    mtu: u32,
}

/// The outcome of one connect-retry tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectTick {
    /// Still waiting (a resend may have gone out).
    Pending,
    /// The attempt budget is spent; the connect has been failed.
    TimedOut,
}

pub(crate) struct NodeShared {
    pub home: String,
    pub udp4_addr: Option<SocketAddr>,
    pub udp6_addr: Option<SocketAddr>,
    pub core: Mutex<NodeCore>,
    signals: Arc<NodeSignals>,
}

impl NodeShared {
    /// Wakes the background worker to recompute its deadline.
    pub fn poke_background(&self) {
        self.signals.background.notify_waiters();
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        // The last endpoint or pipe released the node: stop the receive
        // loops and the background worker.
        tracing::debug!(home = %self.home, "node released");
        self.signals.shutdown.notify_waiters();
    }
}

pub(crate) struct NodeCore {
    pub node_id: NodeId,
    pub closed: bool,
    overlay: Box<dyn Overlay>,
    host: HostState,
    ports: PortRegistry,
    pub endpoints: FxHashMap<Address, EndpointState>,
    pub pipes: FxHashMap<Address, PipeState>,
    /// Remote address to pipe local address; the steady-state guarantee
    /// of one pipe per peer hangs off this index.
    pub peers: FxHashMap<Address, Address>,
    networks: FxHashMap<NetworkId, NetworkState>,
    next_op: u64,
}

impl NodeCore {
    pub fn next_op_id(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    fn network_up(&self, nwid: NetworkId) -> bool {
        self.networks.get(&nwid).map(|n| n.up).unwrap_or(false)
    }

    /// Takes a reference on a network, joining it on the first.
    fn join_network(&mut self, nwid: NetworkId) -> u32 {
        let first = {
            let entry = self.networks.entry(nwid).or_insert(NetworkState {
                refs: 0,
                up: false,
                mtu: 0,
            });
            entry.refs += 1;
            entry.refs == 1
        };
        if first {
            if let Err(error) = self.overlay.join(&mut self.host, nwid) {
                self.overlay_failure(error);
            }
        }
        self.networks.get(&nwid).map(|n| n.mtu).unwrap_or(0)
    }

    fn unref_network(&mut self, nwid: NetworkId) {
        let gone = match self.networks.get_mut(&nwid) {
            Some(network) => {
                network.refs = network.refs.saturating_sub(1);
                network.refs == 0
            }
            None => false,
        };
        if gone {
            self.networks.remove(&nwid);
            if !self.closed {
                if let Err(error) = self.overlay.leave(&mut self.host, nwid) {
                    self.overlay_failure(error);
                }
            }
        }
    }

    fn overlay_failure(&mut self, error: OverlayError) {
        match error {
            OverlayError::Transient(reason) => {
                tracing::warn!(%reason, "overlay dropped work");
            }
            OverlayError::Fatal(reason) => {
                tracing::error!(%reason, "overlay failed, closing node");
                self.shut_down();
            }
        }
    }

    /// Fails every pending operation with an internal error and stops
    /// accepting work. Used when the overlay reports a fatal failure.
    fn shut_down(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for endpoint in self.endpoints.values_mut() {
            match &mut endpoint.mode {
                Mode::Dial(dial) => {
                    if let Some(waiter) = dial.waiter.take() {
                        let _ = waiter.tx.send(Err(Error::Internal));
                    }
                }
                Mode::Listen(listen) => {
                    for waiter in listen.waiters.drain(..) {
                        let _ = waiter.tx.send(Err(Error::Internal));
                    }
                }
            }
        }
        for pipe in self.pipes.values_mut() {
            if let Some(waiter) = pipe.pending_read.take() {
                let _ = waiter.tx.send(Err(Error::Internal));
            }
        }
        self.endpoints.clear();
        self.pipes.clear();
        self.peers.clear();
        self.host.inbox.clear();
        self.host.config_events.clear();
    }

    // --- transmit helpers -------------------------------------------------

    fn send_frame(&mut self, now: u64, nwid: NetworkId, from: Address, to: Address, bytes: &[u8]) {
        let src_mac = addr::mac_for_node(from.node(), nwid);
        let dst_mac = addr::mac_for_node(to.node(), nwid);
        if let Err(error) = self.overlay.send_virtual_frame(
            &mut self.host,
            now,
            nwid,
            src_mac,
            dst_mac,
            frame::ETHERTYPE,
            bytes,
        ) {
            self.overlay_failure(error);
        }
    }

    fn send_error(
        &mut self,
        now: u64,
        nwid: NetworkId,
        laddr: Address,
        raddr: Address,
        code: ErrorCode,
        reason: &str,
    ) {
        let bytes = frame::error_frame(raddr.port(), laddr.port(), code, reason);
        self.send_frame(now, nwid, laddr, raddr, &bytes);
    }

    /// Sends a connection request for a dialing endpoint and counts the
    /// attempt.
    fn send_conn_req(&mut self, now: u64, laddr: Address) {
        let Some(endpoint) = self.endpoints.get_mut(&laddr) else {
            return;
        };
        let nwid = endpoint.nwid;
        let sp_proto = endpoint.sp_proto;
        let Some(dial) = endpoint.dial() else {
            return;
        };
        let raddr = dial.raddr;
        dial.attempt += 1;
        let bytes = frame::conn_frame(Opcode::ConnReq, raddr.port(), laddr.port(), sp_proto);
        self.send_frame(now, nwid, laddr, raddr, &bytes);
    }

    // --- ingest -----------------------------------------------------------

    /// Feeds one received UDP packet through the overlay, then dispatches
    /// whatever it produced.
    pub fn process_wire(&mut self, now: u64, source: SocketAddr, packet: &[u8]) {
        if self.closed {
            return;
        }
        if let Err(error) = self
            .overlay
            .process_wire_packet(&mut self.host, now, source, packet)
        {
            self.overlay_failure(error);
        }
        self.drain(now);
    }

    /// Dispatches queued configuration events and virtual frames. Replies
    /// sent during dispatch may loop straight back into the queue; the
    /// loop runs until both are empty.
    pub fn drain(&mut self, now: u64) {
        loop {
            if self.closed {
                self.host.inbox.clear();
                self.host.config_events.clear();
                return;
            }
            if let Some((op, config)) = self.host.config_events.pop_front() {
                self.apply_config(now, op, config);
                continue;
            }
            if let Some(frame) = self.host.inbox.pop_front() {
                self.handle_frame(now, frame);
                continue;
            }
            break;
        }
    }

    fn apply_config(&mut self, now: u64, op: ConfigOp, config: NetworkConfig) {
        match op {
            ConfigOp::Up | ConfigOp::Update => {
                if let Some(network) = self.networks.get_mut(&config.nwid) {
                    network.up = true;
                    network.mtu = config.mtu;
                }
                let mut kicks = Vec::new();
                for (laddr, endpoint) in self
                    .endpoints
                    .iter_mut()
                    .filter(|(_, e)| e.nwid == config.nwid)
                {
                    endpoint.mtu = config.mtu;
                    if let Mode::Dial(dial) = &endpoint.mode {
                        // A connect waiting for the network to come up
                        // gets its first request out now.
                        if dial.waiter.is_some() && dial.attempt == 0 {
                            kicks.push(*laddr);
                        }
                    }
                }
                for laddr in kicks {
                    self.send_conn_req(now, laddr);
                }
            }
            ConfigOp::Down => {
                if let Some(network) = self.networks.get_mut(&config.nwid) {
                    network.up = false;
                }
            }
        }
    }

    #[tracing::instrument(name = "NodeCore::handle_frame", skip_all)]
    fn handle_frame(&mut self, now: u64, inbound: InboundFrame) {
        let (header, body_bytes) = match frame::parse_header(inbound.ethertype, &inbound.payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%error, "dropping undecodable frame");
                return;
            }
        };
        if addr::node_for_mac(inbound.dst_mac, inbound.nwid) != self.node_id {
            return;
        }
        let laddr = Address::new(self.node_id, header.dst_port);
        let raddr = Address::new(
            addr::node_for_mac(inbound.src_mac, inbound.nwid),
            header.src_port,
        );
        let body = match frame::parse_body(header.op, body_bytes) {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!(%error, %raddr, "malformed frame");
                self.send_error(now, inbound.nwid, laddr, raddr, ErrorCode::Proto, "malformed frame");
                return;
            }
        };

        // Pipes own their port exclusively, so try the pipe index first;
        // a pipe that has not learned its remote yet adopts the sender.
        let mut learned = false;
        let to_pipe = match self.pipes.get_mut(&laddr) {
            Some(pipe) if pipe.raddr == raddr => true,
            Some(pipe) if !pipe.raddr.is_bound() => {
                pipe.raddr = raddr;
                learned = true;
                true
            }
            _ => false,
        };
        if learned {
            self.peers.insert(raddr, laddr);
        }
        if to_pipe {
            self.pipe_frame(now, laddr, raddr, body);
        } else if self.endpoints.contains_key(&laddr) {
            self.endpoint_frame(now, inbound.nwid, laddr, raddr, body);
        } else {
            match body {
                Body::ConnReq { .. } => self.send_error(
                    now,
                    inbound.nwid,
                    laddr,
                    raddr,
                    ErrorCode::Refused,
                    "connection refused",
                ),
                Body::Data { .. } | Body::PingReq | Body::ConnAck { .. } => self.send_error(
                    now,
                    inbound.nwid,
                    laddr,
                    raddr,
                    ErrorCode::NotConn,
                    "no such connection",
                ),
                _ => {}
            }
        }
    }

    fn pipe_frame(&mut self, now: u64, laddr: Address, raddr: Address, body: Body<'_>) {
        enum Action {
            None,
            Ack { proto: u16 },
            PingAck,
            Reject { code: ErrorCode, reason: &'static str },
            Close { reason: Error },
        }

        let Some(pipe) = self.pipes.get_mut(&laddr) else {
            return;
        };
        pipe.mark_alive(now);
        let nwid = pipe.nwid;

        let action = match body {
            Body::Data { head, payload, .. } => {
                use crate::reassembly::FragmentOutcome;
                match pipe.reassembly.deliver(now, pipe.recv_max, &head, payload) {
                    FragmentOutcome::Completed => {
                        if pipe.pending_read.is_some() {
                            if let Some(message) = pipe.reassembly.take_ready() {
                                if let Some(waiter) = pipe.pending_read.take() {
                                    let _ = waiter.tx.send(Ok(message));
                                }
                            }
                        }
                        Action::None
                    }
                    FragmentOutcome::Buffered | FragmentOutcome::Dropped => Action::None,
                    FragmentOutcome::Reject(code) => {
                        if code == ErrorCode::MsgSize {
                            if let Some(waiter) = pipe.pending_read.take() {
                                let _ = waiter.tx.send(Err(Error::MsgSize));
                            }
                            Action::Reject {
                                code,
                                reason: "message exceeds receive limit",
                            }
                        } else {
                            Action::Reject {
                                code,
                                reason: "inconsistent fragmentation",
                            }
                        }
                    }
                }
            }
            // A retransmitted request for an established pipe is answered
            // again, never paired again.
            Body::ConnReq { .. } => Action::Ack {
                proto: pipe.sp_proto,
            },
            Body::ConnAck { .. } => Action::None,
            Body::DiscReq => Action::Close {
                reason: Error::Closed,
            },
            Body::PingReq => Action::PingAck,
            Body::PingAck => Action::None,
            // The wire error table binds the connecting dialer; on an
            // established pipe MSGSIZE reports a discarded message and
            // everything else is dropped. Dead peers fall to keepalive.
            Body::Error { code, reason } => {
                if code == ErrorCode::MsgSize {
                    tracing::warn!(%laddr, "peer rejected an oversized message");
                } else {
                    tracing::debug!(%laddr, ?code, %reason, "ignoring error frame on established pipe");
                }
                Action::None
            }
        };

        match action {
            Action::None => {}
            Action::Ack { proto } => {
                let bytes = frame::conn_frame(Opcode::ConnAck, raddr.port(), laddr.port(), proto);
                self.send_frame(now, nwid, laddr, raddr, &bytes);
            }
            Action::PingAck => {
                let bytes = frame::bare_frame(Opcode::PingAck, raddr.port(), laddr.port());
                self.send_frame(now, nwid, laddr, raddr, &bytes);
            }
            Action::Reject { code, reason } => {
                self.send_error(now, nwid, laddr, raddr, code, reason);
            }
            Action::Close { reason } => {
                self.close_pipe(now, laddr, reason, false);
            }
        }
    }

    fn endpoint_frame(
        &mut self,
        now: u64,
        nwid: NetworkId,
        laddr: Address,
        raddr: Address,
        body: Body<'_>,
    ) {
        enum Action {
            None,
            WrongSp,
            ReAck { pipe_laddr: Address },
            Backlogged,
            Promote { peer_proto: u16 },
            NotConn,
        }

        let established = self.peers.get(&raddr).copied();
        let Some(endpoint) = self.endpoints.get_mut(&laddr) else {
            return;
        };
        let sp_peer = endpoint.sp_peer;

        let action = match (&mut endpoint.mode, body) {
            (Mode::Listen(listen), Body::ConnReq { sp_proto }) => {
                if sp_proto != sp_peer {
                    Action::WrongSp
                } else if let Some(pipe_laddr) = established {
                    Action::ReAck { pipe_laddr }
                } else {
                    listen.push_backlog(now, raddr, sp_proto);
                    Action::Backlogged
                }
            }
            (Mode::Dial(dial), Body::ConnAck { sp_proto }) => {
                if dial.waiter.is_none() {
                    Action::None
                } else if sp_proto != sp_peer {
                    if let Some(waiter) = dial.waiter.take() {
                        let _ = waiter.tx.send(Err(Error::Proto));
                    }
                    dial.attempt = 0;
                    Action::WrongSp
                } else {
                    Action::Promote {
                        peer_proto: sp_proto,
                    }
                }
            }
            (Mode::Dial(dial), Body::Error { code, reason }) => {
                if let Some(waiter) = dial.waiter.take() {
                    let mapped = match code {
                        ErrorCode::Refused => Error::ConnRefused,
                        ErrorCode::NotConn => Error::Closed,
                        ErrorCode::WrongSp => Error::Proto,
                        ErrorCode::Proto | ErrorCode::MsgSize | ErrorCode::Unknown => {
                            Error::Transport(reason)
                        }
                    };
                    let _ = waiter.tx.send(Err(mapped));
                }
                dial.attempt = 0;
                Action::None
            }
            (_, Body::Data { .. }) => Action::NotConn,
            _ => Action::None,
        };

        match action {
            Action::None => {}
            Action::WrongSp => {
                self.send_error(now, nwid, laddr, raddr, ErrorCode::WrongSp, "protocol mismatch");
            }
            Action::ReAck { pipe_laddr } => {
                if let Some(proto) = self.pipes.get(&pipe_laddr).map(|p| p.sp_proto) {
                    let bytes =
                        frame::conn_frame(Opcode::ConnAck, raddr.port(), pipe_laddr.port(), proto);
                    self.send_frame(now, nwid, pipe_laddr, raddr, &bytes);
                }
            }
            Action::Backlogged => self.drain_accepts(now, laddr),
            Action::Promote { peer_proto } => self.promote_dialer(now, laddr, raddr, peer_proto),
            Action::NotConn => {
                self.send_error(now, nwid, laddr, raddr, ErrorCode::NotConn, "no such connection");
            }
        }
    }

    /// Turns an acked dialing endpoint into a pipe. The pipe takes over
    /// the endpoint's local address; the endpoint leaves the index.
    fn promote_dialer(&mut self, now: u64, laddr: Address, raddr: Address, peer_proto: u16) {
        let Some(mut endpoint) = self.endpoints.remove(&laddr) else {
            return;
        };
        let waiter = match endpoint.dial() {
            Some(dial) => dial.waiter.take(),
            None => None,
        };
        let Some(waiter) = waiter else {
            self.endpoints.insert(laddr, endpoint);
            return;
        };
        self.ports.reassign(laddr.port(), PortOwner::Pipe);
        let pipe = PipeState::new(
            endpoint.nwid,
            laddr,
            raddr,
            endpoint.sp_proto,
            peer_proto,
            endpoint.mtu,
            endpoint.recv_max,
            endpoint.ping,
            now,
        );
        self.pipes.insert(laddr, pipe);
        self.peers.insert(raddr, laddr);
        tracing::debug!(%laddr, %raddr, "dialer connected");
        if waiter.tx.send(Ok(laddr)).is_err() {
            // The connect was canceled under us; nobody owns the pipe.
            self.close_pipe(now, laddr, Error::Closed, true);
        }
    }

    /// Pairs waiting accepts with live backlog entries. Each pairing
    /// allocates the pipe its own local port so the listener keeps
    /// serving on its well-known one.
    fn drain_accepts(&mut self, now: u64, laddr: Address) {
        loop {
            let (entry, waiter, nwid, sp_proto, mtu, recv_max, ping) = {
                let Some(endpoint) = self.endpoints.get_mut(&laddr) else {
                    return;
                };
                let nwid = endpoint.nwid;
                let sp_proto = endpoint.sp_proto;
                let mtu = endpoint.mtu;
                let recv_max = endpoint.recv_max;
                let ping = endpoint.ping;
                let Some(listen) = endpoint.listen() else {
                    return;
                };
                if listen.waiters.is_empty() {
                    return;
                }
                let Some(entry) = listen.pop_live(now) else {
                    return;
                };
                let Some(waiter) = listen.waiters.pop_front() else {
                    return;
                };
                (entry, waiter, nwid, sp_proto, mtu, recv_max, ping)
            };

            if let Some(existing) = self.peers.get(&entry.raddr).copied() {
                // Already paired with this remote; answer again and keep
                // the waiter for the next entry.
                if let Some(proto) = self.pipes.get(&existing).map(|p| p.sp_proto) {
                    let bytes = frame::conn_frame(
                        Opcode::ConnAck,
                        entry.raddr.port(),
                        existing.port(),
                        proto,
                    );
                    self.send_frame(now, nwid, existing, entry.raddr, &bytes);
                }
                if let Some(listen) = self
                    .endpoints
                    .get_mut(&laddr)
                    .and_then(|endpoint| endpoint.listen())
                {
                    listen.waiters.push_front(waiter);
                }
                continue;
            }

            let Some(port) = self.ports.allocate(PortOwner::Pipe) else {
                let _ = waiter.tx.send(Err(Error::Internal));
                return;
            };
            let pipe_laddr = Address::new(self.node_id, port);
            self.join_network(nwid);
            self.pipes.insert(
                pipe_laddr,
                PipeState::new(
                    nwid,
                    pipe_laddr,
                    entry.raddr,
                    sp_proto,
                    entry.sp_proto,
                    mtu,
                    recv_max,
                    ping,
                    now,
                ),
            );
            self.peers.insert(entry.raddr, pipe_laddr);
            let bytes = frame::conn_frame(Opcode::ConnAck, entry.raddr.port(), port, sp_proto);
            self.send_frame(now, nwid, pipe_laddr, entry.raddr, &bytes);
            tracing::debug!(laddr = %pipe_laddr, raddr = %entry.raddr, "accepted connection");
            if waiter.tx.send(Ok(pipe_laddr)).is_err() {
                self.close_pipe(now, pipe_laddr, Error::Closed, true);
            }
        }
    }

    // --- user operations --------------------------------------------------

    /// Binds a dialing endpoint on a fresh ephemeral port and joins its
    /// network.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_dialer(
        &mut self,
        nwid: NetworkId,
        raddr: Address,
        sp_proto: u16,
        sp_peer: u16,
        recv_max: u32,
        ping: crate::pipe::PingCfg,
    ) -> Result<Address, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let Some(port) = self.ports.allocate(PortOwner::Endpoint) else {
            return Err(Error::AddrInUse);
        };
        let laddr = Address::new(self.node_id, port);
        let mtu = self.join_network(nwid);
        self.endpoints.insert(
            laddr,
            EndpointState {
                nwid,
                laddr,
                sp_proto,
                sp_peer,
                recv_max,
                mtu,
                ping,
                mode: Mode::Dial(DialState {
                    raddr,
                    attempt: 0,
                    waiter: None,
                }),
            },
        );
        Ok(laddr)
    }

    /// Binds a listening endpoint on a requested or ephemeral port and
    /// joins its network.
    #[allow(clippy::too_many_arguments)]
    pub fn bind_listener(
        &mut self,
        nwid: NetworkId,
        port: Port,
        sp_proto: u16,
        sp_peer: u16,
        recv_max: u32,
        ping: crate::pipe::PingCfg,
    ) -> Result<Address, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let port = if port == 0 {
            let Some(port) = self.ports.allocate(PortOwner::Endpoint) else {
                return Err(Error::AddrInUse);
            };
            port
        } else {
            if !self.ports.insert(port, PortOwner::Endpoint) {
                return Err(Error::AddrInUse);
            }
            port
        };
        let laddr = Address::new(self.node_id, port);
        let mtu = self.join_network(nwid);
        self.endpoints.insert(
            laddr,
            EndpointState {
                nwid,
                laddr,
                sp_proto,
                sp_peer,
                recv_max,
                mtu,
                ping,
                mode: Mode::Listen(Default::default()),
            },
        );
        Ok(laddr)
    }

    /// Arms a connect: installs the waiter and, if the network is already
    /// up, sends the first request.
    pub fn begin_connect(
        &mut self,
        now: u64,
        laddr: Address,
        id: u64,
        tx: tokio::sync::oneshot::Sender<Result<Address, Error>>,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let up = self
            .endpoints
            .get(&laddr)
            .map(|endpoint| self.network_up(endpoint.nwid))
            .unwrap_or(false);
        let Some(dial) = self
            .endpoints
            .get_mut(&laddr)
            .and_then(|endpoint| endpoint.dial())
        else {
            return Err(Error::Closed);
        };
        if dial.waiter.is_some() {
            return Err(Error::Busy);
        }
        dial.attempt = 0;
        dial.waiter = Some(PipeWaiter { id, tx });
        if up {
            self.send_conn_req(now, laddr);
        }
        Ok(())
    }

    /// One retry-timer expiry for a waiting connect.
    pub fn connect_tick(
        &mut self,
        now: u64,
        laddr: Address,
        id: u64,
        max_attempts: u32,
    ) -> ConnectTick {
        let up = self
            .endpoints
            .get(&laddr)
            .map(|endpoint| self.network_up(endpoint.nwid))
            .unwrap_or(false);
        let Some(dial) = self
            .endpoints
            .get_mut(&laddr)
            .and_then(|endpoint| endpoint.dial())
        else {
            return ConnectTick::Pending;
        };
        if dial.waiter.as_ref().map(|w| w.id) != Some(id) {
            // Completed or replaced; the result is on its channel.
            return ConnectTick::Pending;
        }
        if dial.attempt >= max_attempts {
            dial.waiter = None;
            dial.attempt = 0;
            return ConnectTick::TimedOut;
        }
        if !up {
            // The interval still burns an attempt so a network that never
            // comes up cannot stall the connect forever.
            dial.attempt += 1;
            return ConnectTick::Pending;
        }
        self.send_conn_req(now, laddr);
        ConnectTick::Pending
    }

    pub fn cancel_connect(&mut self, laddr: Address, id: u64) {
        if let Some(dial) = self
            .endpoints
            .get_mut(&laddr)
            .and_then(|endpoint| endpoint.dial())
        {
            if dial.waiter.as_ref().map(|w| w.id) == Some(id) {
                dial.waiter = None;
                dial.attempt = 0;
            }
        }
    }

    /// Queues an accept waiter and tries to pair it immediately.
    pub fn begin_accept(
        &mut self,
        now: u64,
        laddr: Address,
        id: u64,
        tx: tokio::sync::oneshot::Sender<Result<Address, Error>>,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let Some(listen) = self
            .endpoints
            .get_mut(&laddr)
            .and_then(|endpoint| endpoint.listen())
        else {
            return Err(Error::Closed);
        };
        listen.waiters.push_back(PipeWaiter { id, tx });
        self.drain_accepts(now, laddr);
        Ok(())
    }

    pub fn cancel_accept(&mut self, laddr: Address, id: u64) {
        if let Some(listen) = self
            .endpoints
            .get_mut(&laddr)
            .and_then(|endpoint| endpoint.listen())
        {
            listen.waiters.retain(|waiter| waiter.id != id);
        }
    }

    /// Closes an endpoint: waiting connects and accepts fail and the
    /// port is released. The fini contract is removal from the indexes.
    pub fn close_endpoint(&mut self, laddr: Address) {
        let Some(mut endpoint) = self.endpoints.remove(&laddr) else {
            return;
        };
        self.ports.remove(laddr.port());
        match &mut endpoint.mode {
            Mode::Dial(dial) => {
                if let Some(waiter) = dial.waiter.take() {
                    let _ = waiter.tx.send(Err(Error::Closed));
                }
            }
            Mode::Listen(listen) => {
                for waiter in listen.waiters.drain(..) {
                    let _ = waiter.tx.send(Err(Error::Closed));
                }
            }
        }
        tracing::debug!(laddr = %endpoint.laddr, "endpoint closed");
        self.unref_network(endpoint.nwid);
    }

    /// Segments one message and hands every fragment to the overlay.
    /// Completion is synchronous and best-effort.
    pub fn pipe_send(&mut self, now: u64, laddr: Address, message: Message) -> Result<(), Error> {
        let Some(pipe) = self.pipes.get_mut(&laddr) else {
            return Err(Error::Closed);
        };
        let frag_size = pipe
            .peer_mtu
            .saturating_sub(frame::DATA_HEADER_OCTETS as u32)
            .min(u32::from(u16::MAX)) as usize;
        if frag_size == 0 {
            return Err(Error::NotConn);
        }
        let total = message.len();
        let nfrags = if total == 0 {
            1
        } else {
            (total + frag_size - 1) / frag_size
        };
        if nfrags >= 0xFFFE {
            return Err(Error::MsgSize);
        }
        let msg_id = pipe.take_msg_id();
        let (nwid, raddr) = (pipe.nwid, pipe.raddr);
        if !raddr.is_bound() {
            return Err(Error::NotConn);
        }

        let mut rest = message;
        for frag_no in 0..nfrags {
            let take = rest.len().min(frag_size);
            let fragment = rest.cut(take);
            let head = frame::DataHeader {
                msg_id,
                frag_size: frag_size as u16,
                frag_no: frag_no as u16,
                nfrags: nfrags as u16,
            };
            let bytes = frame::data_frame(
                raddr.port(),
                laddr.port(),
                head,
                frag_no + 1 < nfrags,
                &fragment,
            );
            self.send_frame(now, nwid, laddr, raddr, &bytes);
        }
        Ok(())
    }

    /// Closes a pipe: the pending read fails, the peer is told
    /// best-effort, and the pipe leaves every index.
    pub fn close_pipe(&mut self, now: u64, laddr: Address, reason: Error, notify_peer: bool) {
        let Some(mut pipe) = self.pipes.remove(&laddr) else {
            return;
        };
        self.ports.remove(laddr.port());
        if self.peers.get(&pipe.raddr) == Some(&laddr) {
            self.peers.remove(&pipe.raddr);
        }
        if let Some(waiter) = pipe.pending_read.take() {
            let _ = waiter.tx.send(Err(reason));
        }
        if notify_peer && pipe.raddr.is_bound() && !self.closed {
            let bytes = frame::bare_frame(Opcode::DiscReq, pipe.raddr.port(), laddr.port());
            self.send_frame(now, pipe.nwid, laddr, pipe.raddr, &bytes);
        }
        tracing::debug!(%laddr, "pipe closed");
        self.unref_network(pipe.nwid);
    }

    // --- background work --------------------------------------------------

    /// Runs the overlay's housekeeping and the keepalive pass; returns
    /// the next wakeup time.
    pub fn background(&mut self, now: u64) -> u64 {
        if self.closed {
            return now + 60_000;
        }
        let overlay_next = match self.overlay.process_background_tasks(&mut self.host, now) {
            Ok(next) => next,
            Err(error) => {
                self.overlay_failure(error);
                now + 60_000
            }
        };
        self.drain(now);
        let ping_next = self.keepalive(now);
        self.drain(now);
        overlay_next.min(ping_next).max(now + 10)
    }

    /// Sends pings on idle pipes and closes pipes whose peer stopped
    /// answering. Returns the earliest next ping deadline.
    fn keepalive(&mut self, now: u64) -> u64 {
        let mut next = now + 60_000;
        let mut pings = Vec::new();
        let mut drops = Vec::new();
        for (laddr, pipe) in self.pipes.iter_mut() {
            if pipe.ping.interval_ms == 0 {
                continue;
            }
            if now >= pipe.next_ping_ms {
                if pipe.pings_outstanding >= pipe.ping.max_misses {
                    drops.push(*laddr);
                    continue;
                }
                pipe.pings_outstanding += 1;
                pipe.next_ping_ms = now + pipe.ping.interval_ms;
                pings.push(*laddr);
            }
            next = next.min(pipe.next_ping_ms);
        }
        for laddr in pings {
            if let Some((nwid, raddr)) = self.pipes.get(&laddr).map(|p| (p.nwid, p.raddr)) {
                let bytes = frame::bare_frame(Opcode::PingReq, raddr.port(), laddr.port());
                self.send_frame(now, nwid, laddr, raddr, &bytes);
            }
        }
        for laddr in drops {
            tracing::debug!(%laddr, "peer stopped answering pings");
            self.close_pipe(now, laddr, Error::Closed, false);
        }
        next
    }
}

// --- node lifecycle -------------------------------------------------------

struct Registry {
    creation: tokio::sync::Mutex<()>,
    nodes: FxDashMap<String, Weak<NodeShared>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        creation: tokio::sync::Mutex::new(()),
        nodes: FxDashMap::default(),
    })
}

/// Returns the node for a home directory, creating it on first use.
/// Nodes with a non-empty home are shared; an empty home names a private
/// in-memory node.
pub(crate) async fn acquire(
    home: &str,
    factory: &Arc<dyn OverlayFactory>,
) -> Result<Arc<NodeShared>, Error> {
    if home.is_empty() {
        return create_node(home, factory.as_ref()).await;
    }
    let registry = registry();
    let _creating = registry.creation.lock().await;
    registry.nodes.retain(|_, weak| weak.strong_count() > 0);
    if let Some(existing) = registry.nodes.get(home).and_then(|weak| weak.upgrade()) {
        return Ok(existing);
    }
    let node = create_node(home, factory.as_ref()).await?;
    registry.nodes.insert(home.to_string(), Arc::downgrade(&node));
    Ok(node)
}

async fn create_node(home: &str, factory: &dyn OverlayFactory) -> Result<Arc<NodeShared>, Error> {
    let udp4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .ok()
        .map(Arc::new);
    let udp6 = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))
        .await
        .ok()
        .map(Arc::new);
    if udp4.is_none() && udp6.is_none() {
        tracing::error!("no UDP socket of either family could be bound");
        return Err(Error::Internal);
    }

    let state = StateStore::open(home).map_err(|error| {
        tracing::error!(%error, home, "cannot open home directory");
        Error::AddrInvalid(format!("unusable home directory {home:?}"))
    })?;
    let mut host = HostState {
        udp4: udp4.clone(),
        udp6: udp6.clone(),
        state,
        inbox: VecDeque::new(),
        config_events: VecDeque::new(),
    };
    let overlay = factory.open(&mut host).map_err(|error| {
        tracing::error!(%error, "overlay failed to open");
        Error::Internal
    })?;
    let node_id = overlay.node_id();
    tracing::debug!(%node_id, home, "node created");

    let signals = Arc::new(NodeSignals::default());
    let node = Arc::new(NodeShared {
        home: home.to_string(),
        udp4_addr: udp4.as_ref().and_then(|s| s.local_addr().ok()),
        udp6_addr: udp6.as_ref().and_then(|s| s.local_addr().ok()),
        core: Mutex::new(NodeCore {
            node_id,
            closed: false,
            overlay,
            host,
            ports: PortRegistry::new(rand::random()),
            endpoints: FxHashMap::default(),
            pipes: FxHashMap::default(),
            peers: FxHashMap::default(),
            networks: FxHashMap::default(),
            next_op: 0,
        }),
        signals: Arc::clone(&signals),
    });

    for socket in [udp4, udp6].into_iter().flatten() {
        spawn_receive_loop(socket, Arc::downgrade(&node), Arc::clone(&signals));
    }
    spawn_background(Arc::downgrade(&node), signals);
    Ok(node)
}

/// One outstanding receive per socket: wait, submit to the overlay under
/// the lock, rearm. Stops when the node goes away.
fn spawn_receive_loop(socket: Arc<UdpSocket>, node: Weak<NodeShared>, signals: Arc<NodeSignals>) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; RECV_BUFFER];
        loop {
            let received = tokio::select! {
                _ = signals.shutdown.notified() => break,
                received = socket.recv_from(&mut buffer) => received,
            };
            let Some(node) = node.upgrade() else {
                break;
            };
            match received {
                Ok((len, source)) => {
                    let now = now_ms();
                    let mut core = node.core.lock().expect("node lock");
                    if core.closed {
                        break;
                    }
                    core.process_wire(now, source, &buffer[..len]);
                }
                Err(error) => {
                    tracing::warn!(%error, "udp receive failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });
}

/// The background worker: sleeps until the next deadline the core asks
/// for, or until poked, and runs the periodic work.
fn spawn_background(node: Weak<NodeShared>, signals: Arc<NodeSignals>) {
    tokio::spawn(async move {
        let mut deadline = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = signals.shutdown.notified() => break,
                _ = signals.background.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            let Some(node) = node.upgrade() else {
                break;
            };
            let now = now_ms();
            let next = {
                let mut core = node.core.lock().expect("node lock");
                if core.closed {
                    break;
                }
                core.background(now)
            };
            deadline = instant_at(next);
        }
    });
}
