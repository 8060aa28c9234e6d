//! The user-facing transport surface: options, dialers, and listeners.
//!
//! Both endpoint kinds are bound from a `zt://` URL and yield [`Pipe`]s:
//! a dialer by [`Dialer::connect`], a listener by [`Listener::accept`].
//! Endpoints naming the same home directory share one node (and one
//! overlay instance) underneath.

use crate::addr::{Address, NetworkId, NodeId};
use crate::error::Error;
use crate::node::{self, now_ms, ConnectTick, NodeShared};
use crate::overlay::OverlayFactory;
use crate::pipe::{PingCfg, Pipe};
use crate::url::ZtUrl;
use crate::MemoryNet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Configuration for dialers and listeners.
///
/// `home` selects (and shares) the node: a non-empty home persists the
/// overlay's identity there, while an empty home makes a private node
/// with in-memory state. `recv_max` of zero means no receive ceiling.
#[derive(Clone)]
pub struct Options {
    pub home: String,
    /// Per-pipe ceiling on reassembled message size; 0 disables it.
    pub recv_max: u32,
    /// Delay between connection-request attempts.
    pub conn_interval: Duration,
    /// Connection-request attempts before a connect times out.
    pub conn_attempts: u32,
    /// Idle time before a keepalive ping; zero disables keepalives.
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before the pipe is closed.
    pub ping_misses: u32,
    /// The overlay implementation nodes are built on.
    pub overlay: Arc<dyn OverlayFactory>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            home: String::new(),
            recv_max: 0,
            conn_interval: Duration::from_secs(5),
            conn_attempts: 12,
            ping_interval: Duration::from_secs(60),
            ping_misses: 3,
            overlay: Arc::new(MemoryNet::new()),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("home", &self.home)
            .field("recv_max", &self.recv_max)
            .field("conn_interval", &self.conn_interval)
            .field("conn_attempts", &self.conn_attempts)
            .field("ping_interval", &self.ping_interval)
            .field("ping_misses", &self.ping_misses)
            .finish_non_exhaustive()
    }
}

impl Options {
    fn ping_cfg(&self) -> PingCfg {
        if self.ping_misses == 0 {
            return PingCfg {
                interval_ms: 0,
                max_misses: 0,
            };
        }
        PingCfg {
            interval_ms: self.ping_interval.as_millis() as u64,
            max_misses: self.ping_misses,
        }
    }
}

/// An outbound endpoint working toward one remote address.
///
/// A dialer survives failed connects and closed pipes; each successful
/// [`Dialer::connect`] hands its bound port to the pipe it produced and
/// a later connect binds a fresh one.
pub struct Dialer {
    node: Arc<NodeShared>,
    url: ZtUrl,
    sp_proto: u16,
    sp_peer: u16,
    options: Options,
    laddr: Mutex<Option<Address>>,
}

impl Dialer {
    /// Parses a dial URL and prepares the node it will dial from.
    pub async fn bind(
        url: &str,
        sp_proto: u16,
        sp_peer: u16,
        options: Options,
    ) -> Result<Self, Error> {
        let url = ZtUrl::parse_dial(url)?;
        let node = node::acquire(&options.home, &options.overlay).await?;
        Ok(Self {
            node,
            url,
            sp_proto,
            sp_peer,
            options,
            laddr: Mutex::new(None),
        })
    }

    /// Establishes a connection, retrying the request every
    /// `conn_interval` until the peer answers or `conn_attempts` requests
    /// have gone unanswered. Dropping the future cancels the attempt.
    pub async fn connect(&self) -> Result<Pipe, Error> {
        let target = self
            .url
            .node
            .ok_or_else(|| Error::AddrInvalid("cannot dial the wildcard node".into()))?;
        let raddr = Address::new(target, self.url.port);
        let interval = self.options.conn_interval.max(Duration::from_millis(1));
        let attempts = self.options.conn_attempts.max(1);

        let (laddr, id, rx) = {
            let now = now_ms();
            let mut core = self.node.core.lock().expect("node lock");
            let mut slot = self.laddr.lock().expect("dialer state");
            let laddr = match *slot {
                Some(existing) if core.endpoints.contains_key(&existing) => existing,
                _ => {
                    let fresh = core.bind_dialer(
                        self.url.nwid,
                        raddr,
                        self.sp_proto,
                        self.sp_peer,
                        self.options.recv_max,
                        self.options.ping_cfg(),
                    )?;
                    *slot = Some(fresh);
                    fresh
                }
            };
            drop(slot);
            core.drain(now);
            let id = core.next_op_id();
            let (tx, rx) = oneshot::channel();
            core.begin_connect(now, laddr, id, tx)?;
            core.drain(now);
            (laddr, id, rx)
        };
        self.node.poke_background();

        let mut guard = ConnectGuard {
            node: Arc::clone(&self.node),
            laddr,
            id,
            rx,
            armed: true,
        };
        loop {
            match tokio::time::timeout(interval, &mut guard.rx).await {
                Ok(Ok(result)) => {
                    guard.armed = false;
                    let pipe_laddr = result?;
                    return Pipe::attach(Arc::clone(&self.node), pipe_laddr);
                }
                Ok(Err(_)) => {
                    guard.armed = false;
                    return Err(Error::Closed);
                }
                Err(_elapsed) => {
                    let now = now_ms();
                    let mut core = self.node.core.lock().expect("node lock");
                    match core.connect_tick(now, laddr, id, attempts) {
                        ConnectTick::Pending => core.drain(now),
                        ConnectTick::TimedOut => {
                            guard.armed = false;
                            return Err(Error::TimedOut);
                        }
                    }
                }
            }
        }
    }

    /// Closes the dialer's bound endpoint, failing a waiting connect.
    pub fn close(&self) {
        let laddr = self.laddr.lock().expect("dialer state").take();
        if let Some(laddr) = laddr {
            let now = now_ms();
            let mut core = self.node.core.lock().expect("node lock");
            core.close_endpoint(laddr);
            core.drain(now);
        }
    }

    /// This endpoint's node identity (the `zt:node` option).
    pub fn node_id(&self) -> NodeId {
        self.node.core.lock().expect("node lock").node_id
    }

    /// The network this dialer operates on (the `zt:nwid` option).
    pub fn network_id(&self) -> NetworkId {
        self.url.nwid
    }

    /// The currently bound local address, if any.
    pub fn local_addr(&self) -> Option<Address> {
        *self.laddr.lock().expect("dialer state")
    }

    /// The node's physical UDP addresses, for seeding peers.
    pub fn wire_addr_v4(&self) -> Option<SocketAddr> {
        self.node.udp4_addr
    }

    pub fn wire_addr_v6(&self) -> Option<SocketAddr> {
        self.node.udp6_addr
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reaps a canceled connect: the waiter leaves the endpoint, and a pipe
/// that completed just as the caller went away is closed, not leaked.
struct ConnectGuard {
    node: Arc<NodeShared>,
    laddr: Address,
    id: u64,
    rx: oneshot::Receiver<Result<Address, Error>>,
    armed: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let now = now_ms();
        let mut core = self.node.core.lock().expect("node lock");
        core.cancel_connect(self.laddr, self.id);
        if let Ok(Ok(pipe_laddr)) = self.rx.try_recv() {
            core.close_pipe(now, pipe_laddr, Error::Canceled, true);
        }
        core.drain(now);
    }
}

/// An inbound endpoint producing one pipe per accepted connection.
///
/// The listener keeps serving on its bound port; every accepted pipe is
/// given its own ephemeral port.
pub struct Listener {
    node: Arc<NodeShared>,
    laddr: Address,
    nwid: NetworkId,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("laddr", &self.laddr)
            .field("nwid", &self.nwid)
            .finish()
    }
}

impl Listener {
    /// Binds a listening endpoint. A URL naming a node id must name the
    /// local node; port 0 picks an ephemeral port.
    pub async fn bind(
        url: &str,
        sp_proto: u16,
        sp_peer: u16,
        options: Options,
    ) -> Result<Self, Error> {
        let url = ZtUrl::parse_listen(url)?;
        let node = node::acquire(&options.home, &options.overlay).await?;
        let laddr = {
            let now = now_ms();
            let mut core = node.core.lock().expect("node lock");
            if let Some(bound) = url.node {
                if bound != core.node_id {
                    return Err(Error::AddrInvalid(
                        "cannot listen on a foreign node id".into(),
                    ));
                }
            }
            let laddr = core.bind_listener(
                url.nwid,
                url.port,
                sp_proto,
                sp_peer,
                options.recv_max,
                options.ping_cfg(),
            )?;
            core.drain(now);
            laddr
        };
        node.poke_background();
        Ok(Self {
            node,
            laddr,
            nwid: url.nwid,
        })
    }

    /// Waits for and returns the next inbound connection. Dropping the
    /// future withdraws from the accept queue.
    pub async fn accept(&self) -> Result<Pipe, Error> {
        let (id, rx) = {
            let now = now_ms();
            let mut core = self.node.core.lock().expect("node lock");
            let id = core.next_op_id();
            let (tx, rx) = oneshot::channel();
            core.begin_accept(now, self.laddr, id, tx)?;
            core.drain(now);
            (id, rx)
        };
        let mut guard = AcceptGuard {
            node: Arc::clone(&self.node),
            laddr: self.laddr,
            id,
            rx,
            armed: true,
        };
        let received = (&mut guard.rx).await;
        guard.armed = false;
        match received {
            Ok(result) => {
                let pipe_laddr = result?;
                Pipe::attach(Arc::clone(&self.node), pipe_laddr)
            }
            Err(_) => Err(Error::Closed),
        }
    }

    /// Closes the listener: waiting accepts fail with [`Error::Closed`]
    /// and the port is released. Established pipes are unaffected.
    pub fn close(&self) {
        let now = now_ms();
        let mut core = self.node.core.lock().expect("node lock");
        core.close_endpoint(self.laddr);
        core.drain(now);
    }

    /// The bound local address, ephemeral port included.
    pub fn local_addr(&self) -> Address {
        self.laddr
    }

    /// This endpoint's node identity (the `zt:node` option).
    pub fn node_id(&self) -> NodeId {
        self.laddr.node()
    }

    /// The network this listener serves (the `zt:nwid` option).
    pub fn network_id(&self) -> NetworkId {
        self.nwid
    }

    /// The node's physical UDP addresses, for seeding peers.
    pub fn wire_addr_v4(&self) -> Option<SocketAddr> {
        self.node.udp4_addr
    }

    pub fn wire_addr_v6(&self) -> Option<SocketAddr> {
        self.node.udp6_addr
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Withdraws a canceled accept and reaps a pipe that raced completion.
struct AcceptGuard {
    node: Arc<NodeShared>,
    laddr: Address,
    id: u64,
    rx: oneshot::Receiver<Result<Address, Error>>,
    armed: bool,
}

impl Drop for AcceptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let now = now_ms();
        let mut core = self.node.core.lock().expect("node lock");
        core.cancel_accept(self.laddr, self.id);
        if let Ok(Ok(pipe_laddr)) = self.rx.try_recv() {
            core.close_pipe(now, pipe_laddr, Error::Canceled, true);
        }
        core.drain(now);
    }
}
