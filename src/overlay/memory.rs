//! An in-process overlay implementation.
//!
//! [`MemoryNet`] stands in for the external overlay library: it hands out
//! 40-bit identities (persisting them through the host's state store),
//! reports networks up immediately with a configurable MTU, delivers
//! frames addressed to the local node directly, and carries frames
//! between rostered nodes as cleartext datagrams over the host's UDP
//! callback. Frames to nodes it has never heard of vanish, exactly like
//! frames to an unreachable peer. It also offers the observation hooks
//! the integration tests lean on: a wire tap of every virtual frame sent
//! and a one-shot reorder buffer for permuting a burst of local frames.

use crate::addr::{self, Address, Mac, NetworkId, NodeId};
use crate::frame::{self, Opcode};
use crate::overlay::{
    ConfigOp, NetworkConfig, Overlay, OverlayError, OverlayFactory, OverlayHost, StateObject,
};
use crate::FxDashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// The default virtual-network MTU, matching common overlay defaults.
pub const DEFAULT_MTU: u32 = 2800;

const PHY_MTU: u32 = 1500;

/// Encapsulation header: magic(2) nwid(8) src_mac(6) dst_mac(6) ethertype(2).
const WIRE_HEADER: usize = 24;
const WIRE_MAGIC: [u8; 2] = [0x5A, 0x54];

/// One observed virtual frame, parsed just enough to identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapRecord {
    pub nwid: NetworkId,
    pub op: u8,
    pub src: Address,
    pub dst: Address,
}

struct Reorder {
    perm: Vec<usize>,
    captured: Vec<(NetworkId, Mac, Mac, u16, Vec<u8>)>,
}

struct NetInner {
    roster: FxDashMap<NodeId, SocketAddr>,
    mtus: FxDashMap<NetworkId, u32>,
    taps: Mutex<Vec<TapRecord>>,
    reorder: Mutex<Option<Reorder>>,
    duplicate: Mutex<usize>,
}

/// A shared in-process overlay network. Clone it into the [`Options`] of
/// every endpoint that should live on the same virtual world.
///
/// [`Options`]: crate::transport::Options
#[derive(Clone)]
pub struct MemoryNet {
    inner: Arc<NetInner>,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                roster: FxDashMap::default(),
                mtus: FxDashMap::default(),
                taps: Mutex::new(Vec::new()),
                reorder: Mutex::new(None),
                duplicate: Mutex::new(0),
            }),
        }
    }

    /// Overrides the MTU reported for a network.
    pub fn set_network_mtu(&self, nwid: NetworkId, mtu: u32) {
        self.inner.mtus.insert(nwid, mtu);
    }

    /// Seeds the roster with a node's physical address, the way a planet
    /// file would. Nodes also learn each other's addresses from received
    /// wire packets.
    pub fn locate(&self, node: NodeId, addr: SocketAddr) {
        self.inner.roster.insert(node, addr);
    }

    /// Drops a node from the roster. Until the node is heard from again,
    /// frames toward it vanish, as if it went offline.
    pub fn forget(&self, node: NodeId) {
        self.inner.roster.remove(&node);
    }

    /// A copy of every virtual frame observed so far.
    pub fn frames(&self) -> Vec<TapRecord> {
        self.inner.taps.lock().expect("tap lock").clone()
    }

    /// How many frames with the given opcode have been observed.
    pub fn count(&self, op: Opcode) -> usize {
        self.frames().iter().filter(|t| t.op == op as u8).count()
    }

    /// Arms a one-shot reorder: the next `perm.len()` locally-delivered
    /// frames are buffered and then released in the order `perm` gives.
    pub fn reorder_next(&self, perm: Vec<usize>) {
        *self.inner.reorder.lock().expect("reorder lock") = Some(Reorder {
            perm,
            captured: Vec::new(),
        });
    }

    /// Delivers each of the next `count` locally-delivered frames twice,
    /// imitating a duplicating network.
    pub fn duplicate_next(&self, count: usize) {
        *self.inner.duplicate.lock().expect("duplicate lock") = count;
    }
}

impl Default for MemoryNet {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayFactory for MemoryNet {
    fn open(&self, host: &mut dyn OverlayHost) -> Result<Box<dyn Overlay>, OverlayError> {
        let node_id = match host
            .state_get(StateObject::IdentitySecret, 256)
            .and_then(|bytes| parse_identity(&bytes))
        {
            Some(existing) => existing,
            None => {
                let mut rng = rand::thread_rng();
                let node_id = loop {
                    let candidate = NodeId::new(rng.gen::<u64>());
                    if candidate.as_u64() != 0 {
                        break candidate;
                    }
                };
                let secret: u64 = rng.gen();
                host.state_put(
                    StateObject::IdentitySecret,
                    format!("{node_id}:{secret:016x}").as_bytes(),
                );
                host.state_put(StateObject::IdentityPublic, node_id.to_string().as_bytes());
                node_id
            }
        };

        // A planet written by an earlier run re-seeds the roster.
        if let Some(planet) = host.state_get(StateObject::Planet, 64 * 1024) {
            for (node, addr) in parse_planet(&planet) {
                self.inner.roster.entry(node).or_insert(addr);
            }
        }

        Ok(Box::new(MemoryOverlay {
            net: Arc::clone(&self.inner),
            node_id,
        }))
    }
}

fn parse_identity(bytes: &[u8]) -> Option<NodeId> {
    let text = std::str::from_utf8(bytes).ok()?;
    let node = text.split(':').next()?;
    let raw = u64::from_str_radix(node.trim(), 16).ok()?;
    (raw != 0).then(|| NodeId::new(raw))
}

fn parse_planet(bytes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let (node, addr) = line.split_once(' ')?;
            let node = u64::from_str_radix(node, 16).ok()?;
            let addr = addr.parse().ok()?;
            Some((NodeId::new(node), addr))
        })
        .collect()
}

struct MemoryOverlay {
    net: Arc<NetInner>,
    node_id: NodeId,
}

impl MemoryOverlay {
    fn network_mtu(&self, nwid: NetworkId) -> u32 {
        self.net.mtus.get(&nwid).map(|m| *m).unwrap_or(DEFAULT_MTU)
    }

    fn tap(&self, nwid: NetworkId, src_mac: Mac, dst_mac: Mac, ethertype: u16, payload: &[u8]) {
        let Ok((header, _)) = frame::parse_header(ethertype, payload) else {
            return;
        };
        let record = TapRecord {
            nwid,
            op: header.op,
            src: Address::new(addr::node_for_mac(src_mac, nwid), header.src_port),
            dst: Address::new(addr::node_for_mac(dst_mac, nwid), header.dst_port),
        };
        self.net.taps.lock().expect("tap lock").push(record);
    }

    fn write_planet(&self, host: &mut dyn OverlayHost) {
        let mut planet = String::new();
        for entry in self.net.roster.iter() {
            planet.push_str(&format!("{} {}\n", entry.key(), entry.value()));
        }
        host.state_put(StateObject::Planet, planet.as_bytes());
    }

    fn deliver_local(
        &self,
        host: &mut dyn OverlayHost,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) {
        let mut pending = self.net.reorder.lock().expect("reorder lock");
        if let Some(reorder) = pending.as_mut() {
            reorder
                .captured
                .push((nwid, src_mac, dst_mac, ethertype, payload.to_vec()));
            if reorder.captured.len() == reorder.perm.len() {
                let reorder = pending.take().expect("reorder present");
                drop(pending);
                for index in reorder.perm {
                    if let Some((nwid, src, dst, ethertype, bytes)) =
                        reorder.captured.get(index).cloned()
                    {
                        host.virtual_frame(nwid, src, dst, ethertype, &bytes);
                    }
                }
            }
            return;
        }
        drop(pending);
        let copies = {
            let mut remaining = self.net.duplicate.lock().expect("duplicate lock");
            if *remaining > 0 {
                *remaining -= 1;
                2
            } else {
                1
            }
        };
        for _ in 0..copies {
            host.virtual_frame(nwid, src_mac, dst_mac, ethertype, payload);
        }
    }
}

impl Overlay for MemoryOverlay {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn join(&mut self, host: &mut dyn OverlayHost, nwid: NetworkId) -> Result<(), OverlayError> {
        host.network_config(
            ConfigOp::Up,
            NetworkConfig {
                nwid,
                mtu: self.network_mtu(nwid),
                phy_mtu: PHY_MTU,
            },
        );
        self.write_planet(host);
        Ok(())
    }

    fn leave(&mut self, host: &mut dyn OverlayHost, nwid: NetworkId) -> Result<(), OverlayError> {
        host.network_config(
            ConfigOp::Down,
            NetworkConfig {
                nwid,
                mtu: self.network_mtu(nwid),
                phy_mtu: PHY_MTU,
            },
        );
        Ok(())
    }

    fn process_wire_packet(
        &mut self,
        host: &mut dyn OverlayHost,
        _now_ms: u64,
        source: SocketAddr,
        packet: &[u8],
    ) -> Result<(), OverlayError> {
        if packet.len() < WIRE_HEADER || packet[0..2] != WIRE_MAGIC {
            tracing::trace!("discarding unrecognized wire packet");
            return Ok(());
        }
        let nwid = NetworkId::from_be_bytes(packet[2..10].try_into().expect("sized slice"));
        let src_mac = read_mac(&packet[10..16]);
        let dst_mac = read_mac(&packet[16..22]);
        let ethertype = u16::from_be_bytes([packet[22], packet[23]]);
        if addr::node_for_mac(dst_mac, nwid) != self.node_id {
            // Not ours and this overlay does not relay.
            return Ok(());
        }
        // Path learning: remember where the sender lives.
        self.net
            .roster
            .insert(addr::node_for_mac(src_mac, nwid), source);
        host.virtual_frame(nwid, src_mac, dst_mac, ethertype, &packet[WIRE_HEADER..]);
        Ok(())
    }

    fn send_virtual_frame(
        &mut self,
        host: &mut dyn OverlayHost,
        _now_ms: u64,
        nwid: NetworkId,
        src_mac: Mac,
        dst_mac: Mac,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<(), OverlayError> {
        self.tap(nwid, src_mac, dst_mac, ethertype, payload);
        let dst_node = addr::node_for_mac(dst_mac, nwid);
        if dst_node == self.node_id {
            self.deliver_local(host, nwid, src_mac, dst_mac, ethertype, payload);
            return Ok(());
        }
        let Some(dest) = self.net.roster.get(&dst_node).map(|a| *a) else {
            tracing::trace!(node = %dst_node, "dropping frame for unknown node");
            return Ok(());
        };
        let mut packet = Vec::with_capacity(WIRE_HEADER + payload.len());
        packet.extend_from_slice(&WIRE_MAGIC);
        packet.extend_from_slice(&nwid.to_be_bytes());
        packet.extend_from_slice(&src_mac.to_be_bytes()[2..]);
        packet.extend_from_slice(&dst_mac.to_be_bytes()[2..]);
        packet.extend_from_slice(&ethertype.to_be_bytes());
        packet.extend_from_slice(payload);
        host.wire_send(dest, &packet);
        Ok(())
    }

    fn process_background_tasks(
        &mut self,
        _host: &mut dyn OverlayHost,
        now_ms: u64,
    ) -> Result<u64, OverlayError> {
        Ok(now_ms + 500)
    }
}

fn read_mac(bytes: &[u8]) -> Mac {
    let mut mac = 0u64;
    for &byte in bytes {
        mac = (mac << 8) | u64::from(byte);
    }
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_text_round_trips() {
        let node = NodeId::new(0xabcdef1234);
        let text = format!("{node}:{:016x}", 7u64);
        assert_eq!(parse_identity(text.as_bytes()), Some(node));
        assert_eq!(parse_identity(b"garbage"), None);
        assert_eq!(parse_identity(b"0:00"), None);
    }

    #[test]
    fn planet_text_round_trips() {
        let text = "ab12 127.0.0.1:4000\nbad line\ncd34 [::1]:9\n";
        let parsed = parse_planet(text.as_bytes());
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, NodeId::new(0xab12));
        assert_eq!(parsed[1].1, "[::1]:9".parse().unwrap());
    }
}
