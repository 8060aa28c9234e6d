//! Strict parsing of `zt://` transport URLs.
//!
//! Dial form: `zt://<nwid>/<node>:<port>` with a 1–16 hex-digit network
//! id, a 1–10 hex-digit node id (or `*`), and a decimal port in
//! `[1, 0xFFFFFF]`. Listen form: `zt://<nwid>[/<node_or_*>]:<port>` where
//! port 0 requests an ephemeral port. Anything else is rejected.

use crate::addr::{NetworkId, NodeId, Port, PORT_MAX};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while_m_n},
    character::complete::{char, digit1},
    combinator::{all_consuming, opt},
    sequence::preceded,
    IResult,
};
use thiserror::Error as ThisError;

/// A parsed transport URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZtUrl {
    /// The virtual network to dial or listen on.
    pub nwid: NetworkId,
    /// The target or bound node; `None` is the `*` wildcard (the local
    /// node for listeners).
    pub node: Option<NodeId>,
    /// The 24-bit transport port; 0 asks a listener for an ephemeral one.
    pub port: Port,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a well-formed zt:// URL")]
    Malformed,
    #[error("dial URLs require a node id segment")]
    MissingNode,
    #[error("port out of range")]
    BadPort,
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn raw_url(input: &str) -> IResult<&str, (&str, Option<&str>, &str)> {
    let (input, _) = tag("zt://")(input)?;
    let (input, nwid) = take_while_m_n(1, 16, is_hex)(input)?;
    let (input, node) = opt(preceded(
        char('/'),
        alt((tag("*"), take_while_m_n(1, 10, is_hex))),
    ))(input)?;
    let (input, _) = char(':')(input)?;
    let (input, port) = digit1(input)?;
    Ok((input, (nwid, node, port)))
}

fn parse_parts(input: &str) -> Result<(NetworkId, Option<Option<NodeId>>, Port), ParseError> {
    let (_, (nwid, node, port)) =
        all_consuming(raw_url)(input).map_err(|_| ParseError::Malformed)?;
    let nwid = NetworkId::from_str_radix(nwid, 16).map_err(|_| ParseError::Malformed)?;
    let node = match node {
        None => None,
        Some("*") => Some(None),
        Some(digits) => {
            let raw = u64::from_str_radix(digits, 16).map_err(|_| ParseError::Malformed)?;
            Some(Some(NodeId::new(raw)))
        }
    };
    let port: Port = port.parse().map_err(|_| ParseError::BadPort)?;
    if port > PORT_MAX {
        return Err(ParseError::BadPort);
    }
    Ok((nwid, node, port))
}

impl ZtUrl {
    /// Parses a dial URL. The node segment is mandatory (though it may be
    /// the wildcard) and the port must be nonzero.
    pub fn parse_dial(input: &str) -> Result<Self, ParseError> {
        let (nwid, node, port) = parse_parts(input)?;
        let node = node.ok_or(ParseError::MissingNode)?;
        if port == 0 {
            return Err(ParseError::BadPort);
        }
        Ok(Self { nwid, node, port })
    }

    /// Parses a listen URL. The node segment is optional and port 0 means
    /// "pick an ephemeral port".
    pub fn parse_listen(input: &str) -> Result<Self, ParseError> {
        let (nwid, node, port) = parse_parts(input)?;
        Ok(Self {
            nwid,
            node: node.flatten(),
            port,
        })
    }
}
