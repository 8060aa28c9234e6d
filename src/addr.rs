//! Transport addressing: node ids, ports, packed addresses, and the
//! mapping between transport nodes and virtual-L2 MAC addresses.

use std::fmt::{self, Display};

/// A 64-bit virtual network identifier.
pub type NetworkId = u64;

/// A 48-bit virtual-L2 MAC address stored in the low bits of a `u64`.
pub type Mac = u64;

/// A 24-bit transport port stored in the low bits of a `u32`.
pub type Port = u32;

/// The highest valid port number.
pub const PORT_MAX: Port = 0x00FF_FFFF;

/// The first ephemeral port. Ports below this are claimed explicitly by
/// listeners; ports at or above it are allocated from a seeded cursor.
pub const PORT_EPHEMERAL: Port = 0x0080_0000;

/// A 40-bit overlay node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// The mask covering the identity's 40 significant bits.
    pub const MASK: u64 = 0x00FF_FFFF_FFFF;

    pub fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

/// A packed transport address: `node(40) | port(24)`.
///
/// Addresses are the canonical key for every demultiplexing index in a
/// node. The all-zero address stands for "unbound".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// The unbound address.
    pub const NIL: Address = Address(0);

    pub fn new(node: NodeId, port: Port) -> Self {
        Self((node.as_u64() << 24) | u64::from(port & PORT_MAX))
    }

    pub fn node(self) -> NodeId {
        NodeId::new(self.0 >> 24)
    }

    pub fn port(self) -> Port {
        (self.0 & u64::from(PORT_MAX)) as Port
    }

    /// Whether the address names an actual endpoint (port zero means
    /// unbound).
    pub fn is_bound(self) -> bool {
        self.port() != 0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node(), self.port())
    }
}

/// Derives the virtual MAC a node uses on a given network.
///
/// The top octet is the low byte of the network id with the multicast bit
/// cleared and the locally-administered bit set, avoiding 0x52 (used by
/// KVM and friends); the node id fills the low 40 bits; the remaining
/// network-id bytes are XORed in, in reverse byte order, so that distinct
/// networks yield distinct MACs for the same node.
pub fn mac_for_node(node: NodeId, nwid: NetworkId) -> Mac {
    let mut octet = (nwid & 0xfe) | 0x02;
    if octet == 0x52 {
        octet = 0x32;
    }
    let mut mac = (octet << 40) | node.as_u64();
    mac ^= ((nwid >> 8) & 0xff) << 32;
    mac ^= ((nwid >> 16) & 0xff) << 24;
    mac ^= ((nwid >> 24) & 0xff) << 16;
    mac ^= ((nwid >> 32) & 0xff) << 8;
    mac ^= (nwid >> 40) & 0xff;
    mac
}

/// Recovers the node id from a virtual MAC on a given network. Inverse of
/// [`mac_for_node`]: the XOR layer undoes itself and the top octet is
/// discarded.
pub fn node_for_mac(mac: Mac, nwid: NetworkId) -> NodeId {
    let mut node = mac & NodeId::MASK;
    node ^= ((nwid >> 8) & 0xff) << 32;
    node ^= ((nwid >> 16) & 0xff) << 24;
    node ^= ((nwid >> 24) & 0xff) << 16;
    node ^= ((nwid >> 32) & 0xff) << 8;
    node ^= (nwid >> 40) & 0xff;
    NodeId::new(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_packs_and_unpacks() {
        let node = NodeId::new(0xfedc_ba98_76);
        let addr = Address::new(node, 0x00ab_cdef);
        assert_eq!(addr.node(), node);
        assert_eq!(addr.port(), 0x00ab_cdef);
        assert!(addr.is_bound());
        assert!(!Address::NIL.is_bound());
    }

    #[test]
    fn node_id_truncates_to_40_bits() {
        assert_eq!(NodeId::new(u64::MAX).as_u64(), NodeId::MASK);
    }

    #[test]
    fn mac_round_trips() {
        for &nwid in &[0xa09a_cf02_33u64, 0, u64::MAX, 0x8056_c2e2_1c00_0001] {
            for &raw in &[1u64, 0xdead_beef_42, NodeId::MASK] {
                let node = NodeId::new(raw);
                let mac = mac_for_node(node, nwid);
                assert_eq!(node_for_mac(mac, nwid), node, "nwid {nwid:#x}");
            }
        }
    }

    #[test]
    fn mac_top_octet_is_local_unicast() {
        let mac = mac_for_node(NodeId::new(0x12345), 0xa09a_cf02_33);
        let octet = (mac >> 40) & 0xff;
        assert_eq!(octet & 0x01, 0, "multicast bit must be clear");
        assert_eq!(octet & 0x02, 0x02, "locally-administered bit must be set");
    }

    #[test]
    fn mac_avoids_kvm_octet() {
        // A network id whose low byte would produce the 0x52 prefix.
        let nwid = 0x0000_0000_0000_0050u64;
        let mac = mac_for_node(NodeId::new(7), nwid);
        assert_eq!((mac >> 40) & 0xff, 0x32);
        assert_eq!(node_for_mac(mac, nwid), NodeId::new(7));
    }

    #[test]
    fn distinct_networks_distinct_macs() {
        let node = NodeId::new(0xabcdef);
        assert_ne!(
            mac_for_node(node, 0x1111_2222_3333_4444),
            mac_for_node(node, 0x5555_6666_7777_8888)
        );
    }
}
