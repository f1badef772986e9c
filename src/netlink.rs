//! nfnetlink conntrack transport
//!
//! Hand-rolled ctnetlink over a raw `NETLINK_NETFILTER` socket. The
//! connection table drives this module through two channels: a
//! request/response socket for the one-time full-table dump, and a
//! multicast-subscribed socket for live event notifications.
//!
//! - `socket`: netlink socket lifecycle (RAII, non-blocking mode, filter
//!   attach)
//! - `structures`: kernel ABI structures and constants (repr(C))
//! - `message`: dump request construction, message/attribute parsing
//! - `filter`: kernel-side TCP-only classic-BPF socket filter

pub mod filter;
pub mod message;
pub mod socket;
pub mod structures;

// The surface the rest of the crate consumes.
pub use filter::tcp_only_filter;
pub use message::{
    build_dump_request, parse_conntrack_messages, ConntrackRecord, EventKind, MessageError,
    ParsedMessage, RawTuple,
};
pub use socket::{NetlinkSocket, SocketError};
