//! Connection entity
//!
//! One kernel conntrack entry at a point in time: both directional
//! tuples, the raw TCP sub-state, and the notification type that
//! produced the record. Values are immutable once constructed; the
//! table replaces whole entries instead of mutating them, so a reader
//! can never observe a half-updated connection.

use crate::local_addrs::LocalAddresses;
use crate::netlink::structures::IPPROTO_TCP;
use crate::netlink::{ConntrackRecord, EventKind, RawTuple};
use crate::state::{classify, ConnectionState, TcpState};
use serde::Serialize;
use std::net::Ipv4Addr;

/// One directional address/port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl Tuple {
    fn from_raw(raw: RawTuple) -> Self {
        Self {
            src_ip: raw.src_ip,
            src_port: raw.src_port,
            dst_ip: raw.dst_ip,
            dst_port: raw.dst_port,
        }
    }

    #[must_use]
    pub fn src_host(&self) -> String {
        format!("{}:{}", self.src_ip, self.src_port)
    }

    #[must_use]
    pub fn dst_host(&self) -> String {
        format!("{}:{}", self.dst_ip, self.dst_port)
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// One tracked TCP connection
///
/// Identity is the (original, reply) tuple pair and nothing else: two
/// records that differ only in TCP sub-state or notification type are
/// the same connection at different moments. The kernel-assigned
/// conntrack id is deliberately not used; it is not stable across a
/// dump/event view of the same flow.
#[derive(Debug, Clone)]
pub struct Connection {
    original: Tuple,
    reply: Tuple,
    tcp_state: Option<TcpState>,
    event: EventKind,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original && self.reply == other.reply
    }
}

impl Eq for Connection {}

impl Connection {
    /// Construct a connection from a decoded conntrack record.
    ///
    /// Returns `None` for records that are not complete IPv4 TCP
    /// entries: wrong or missing L4 protocol, or either tuple absent.
    /// This is the client-side guard behind the kernel-side filter.
    #[must_use]
    pub fn from_record(record: &ConntrackRecord) -> Option<Self> {
        if record.l4proto != Some(IPPROTO_TCP) {
            return None;
        }
        let original = Tuple::from_raw(record.original?);
        let reply = Tuple::from_raw(record.reply?);
        Some(Self {
            original,
            reply,
            tcp_state: record.tcp_state.and_then(TcpState::from_raw),
            event: record.event,
        })
    }

    /// Test constructor with explicit fields.
    #[cfg(test)]
    pub(crate) fn new(
        original: Tuple,
        reply: Tuple,
        tcp_state: Option<TcpState>,
        event: EventKind,
    ) -> Self {
        Self {
            original,
            reply,
            tcp_state,
            event,
        }
    }

    /// Same connection, re-tagged with a different notification type.
    /// Used when dump rows (which decode as `Update`) are remapped to
    /// `New` during a rebuild.
    #[must_use]
    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    #[must_use]
    pub fn original(&self) -> &Tuple {
        &self.original
    }

    #[must_use]
    pub fn reply(&self) -> &Tuple {
        &self.reply
    }

    #[must_use]
    pub fn event(&self) -> EventKind {
        self.event
    }

    /// True iff the record carried a real TCP sub-state (present and not
    /// the untracked marker).
    #[must_use]
    pub fn has_state(&self) -> bool {
        matches!(self.tcp_state, Some(s) if s != TcpState::None)
    }

    /// Lifecycle state of the connection.
    ///
    /// # Panics
    ///
    /// Calling this without checking `has_state()` is a caller bug and
    /// panics; so does an internal kernel state marker reaching this
    /// point (transport contract violation).
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.tcp_state {
            Some(s) if s != TcpState::None => classify(s),
            _ => panic!("state() called on a connection without a TCP state"),
        }
    }

    /// Resolve which endpoint is remote, as `ip:port`.
    ///
    /// Checked in strict priority order, first match wins. The original
    /// tuple is consulted before the reply tuple because it most
    /// reliably reflects who initiated the connection; the final arm is
    /// a best-effort guess for flows where no local address matches at
    /// all (asymmetric NAT or visibility).
    #[must_use]
    pub fn remote_host(&self, local: &LocalAddresses) -> String {
        if local.contains(self.original.src_ip) {
            self.original.dst_host()
        } else if local.contains(self.original.dst_ip) {
            self.original.src_host()
        } else if local.contains(self.reply.src_ip) {
            self.reply.dst_host()
        } else {
            self.reply.src_host()
        }
    }

    /// Raw sub-state name for logs, `"untracked"` when absent.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        match self.tcp_state {
            Some(s) if s != TcpState::None => s.name(),
            _ => "untracked",
        }
    }

    /// Structured single-line JSON rendering for machine consumption.
    #[must_use]
    pub fn to_json_string(&self, local: &LocalAddresses) -> String {
        #[derive(Serialize)]
        struct ConnectionEvent<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            event: Option<&'a str>,
            original: String,
            reply: String,
            remote_host: String,
            state: &'a str,
        }

        let rendered = ConnectionEvent {
            event: match self.event {
                EventKind::Unknown => None,
                known => Some(known.label()),
            },
            original: self.original.to_string(),
            reply: self.reply.to_string(),
            remote_host: self.remote_host(local),
            state: self.state_name(),
        };
        serde_json::to_string(&rendered)
            .expect("a connection event always serializes to JSON")
    }

    /// conntrack-tool-style rendering, for operators used to correlating
    /// with `conntrack -E` output.
    #[must_use]
    pub fn to_netfilter_string(&self) -> String {
        let tag = match self.event {
            EventKind::New => "[NEW] ",
            EventKind::Update => "[UPDATE] ",
            EventKind::Destroy => "[DESTROY] ",
            EventKind::Unknown => "",
        };
        format!(
            "{tag}tcp      6 {state} src={} dst={} sport={} dport={} src={} dst={} sport={} dport={}",
            self.original.src_ip,
            self.original.dst_ip,
            self.original.src_port,
            self.original.dst_port,
            self.reply.src_ip,
            self.reply.dst_ip,
            self.reply.src_port,
            self.reply.dst_port,
            state = self.state_name(),
        )
    }
}

// TESTS
