//! TCP lifecycle state classification
//!
//! The kernel tracks TCP connections through eleven-plus conntrack
//! sub-states; the exporter coarsens them to four lifecycle states that
//! stay stable enough to label metrics with.

use crate::netlink::structures::*;

/// Raw kernel conntrack TCP sub-state (enum `tcp_conntrack`).
///
/// `None` is the untracked marker: the entry no longer carries a real
/// TCP state (tracking stopped), which is not itself a lifecycle state.
/// `Max` and `Ignore` are internal markers of the kernel state machine
/// that must never appear on the wire; observing one means either the
/// kernel or our decoding broke its contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    /// Simultaneous open (kernel value 9, shared with the legacy LISTEN
    /// name).
    SynSent2,
    Max,
    Ignore,
}

impl TcpState {
    /// Decode a kernel sub-state byte. Returns `None` for values outside
    /// the `tcp_conntrack` enum.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            TCP_CONNTRACK_NONE => Some(TcpState::None),
            TCP_CONNTRACK_SYN_SENT => Some(TcpState::SynSent),
            TCP_CONNTRACK_SYN_RECV => Some(TcpState::SynRecv),
            TCP_CONNTRACK_ESTABLISHED => Some(TcpState::Established),
            TCP_CONNTRACK_FIN_WAIT => Some(TcpState::FinWait),
            TCP_CONNTRACK_CLOSE_WAIT => Some(TcpState::CloseWait),
            TCP_CONNTRACK_LAST_ACK => Some(TcpState::LastAck),
            TCP_CONNTRACK_TIME_WAIT => Some(TcpState::TimeWait),
            TCP_CONNTRACK_CLOSE => Some(TcpState::Close),
            TCP_CONNTRACK_SYN_SENT2 => Some(TcpState::SynSent2),
            TCP_CONNTRACK_MAX => Some(TcpState::Max),
            TCP_CONNTRACK_IGNORE => Some(TcpState::Ignore),
            _ => None,
        }
    }

    /// True for every sub-state that represents an actual point in the
    /// TCP lifecycle (everything except the untracked marker and the
    /// two must-never-occur markers).
    #[must_use]
    pub const fn is_lifecycle_state(self) -> bool {
        !matches!(self, TcpState::None | TcpState::Max | TcpState::Ignore)
    }

    /// Kernel-style name, as conntrack tooling prints it.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TcpState::None => "NONE",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::SynSent2 => "SYN_SENT2",
            TcpState::Max => "MAX",
            TcpState::Ignore => "IGNORE",
        }
    }
}

/// Coarse lifecycle state exported as metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 4] = [
        ConnectionState::Opening,
        ConnectionState::Open,
        ConnectionState::Closing,
        ConnectionState::Closed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Opening => "Opening",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw TCP sub-state to its lifecycle state.
///
/// Pure and total over every sub-state the kernel can legitimately
/// report for a tracked TCP connection.
///
/// # Panics
///
/// Panics on the untracked marker (`None`), which callers must screen
/// out via `Connection::has_state()` first, and on the `Max`/`Ignore`
/// markers, whose observation is an invariant violation in the
/// transport, not a classifiable input.
#[must_use]
pub fn classify(state: TcpState) -> ConnectionState {
    match state {
        TcpState::SynSent | TcpState::SynSent2 | TcpState::SynRecv => ConnectionState::Opening,
        TcpState::Established => ConnectionState::Open,
        TcpState::FinWait | TcpState::CloseWait | TcpState::LastAck | TcpState::TimeWait => {
            ConnectionState::Closing
        }
        TcpState::Close => ConnectionState::Closed,
        TcpState::None => {
            panic!("classify() called on an untracked entry; check has_state() first")
        }
        TcpState::Max | TcpState::Ignore => {
            panic!("kernel reported internal TCP state marker {}", state.name())
        }
    }
}

// TESTS
