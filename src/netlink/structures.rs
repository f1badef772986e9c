//! Binary structures for the nfnetlink conntrack protocol
//!
//! These structures use `#[repr(C)]` to match kernel layout exactly.
//! Netlink headers use host byte order; IP addresses and ports carried
//! inside conntrack attributes use network byte order (big-endian).

// NETLINK MESSAGE HEADER

/// Netlink message header (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

// NFNETLINK GENERIC HEADER

/// nfnetlink message header (4 bytes), follows `NlMsgHdr` in every
/// nfnetlink message
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NfGenMsg {
    pub nfgen_family: u8,
    pub version: u8,
    pub res_id: u16,
}

// NETLINK ATTRIBUTE HEADER

/// Netlink attribute header (4 bytes), TLV encoding
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NlAttr {
    pub nla_len: u16,
    pub nla_type: u16,
}

// CONSTANTS

// Netlink control message types
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

// Netlink flags
pub const NLM_F_REQUEST: u16 = 1;
pub const NLM_F_MULTI: u16 = 2;
pub const NLM_F_ACK: u16 = 4;

// Flags for GET requests
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Flags the kernel sets on NEW events (absent on pure state updates)
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

// nfnetlink subsystems and conntrack message types.
// The full nlmsg_type of a conntrack message is (subsystem << 8) | type.
pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;
pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_GET: u8 = 1;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;
pub const NFNETLINK_V0: u8 = 0;

/// Extract the subsystem id from a full nlmsg_type
#[must_use]
pub const fn nfnl_subsys(nlmsg_type: u16) -> u8 {
    (nlmsg_type >> 8) as u8
}

/// Extract the per-subsystem message type from a full nlmsg_type
#[must_use]
pub const fn nfnl_msg_type(nlmsg_type: u16) -> u8 {
    (nlmsg_type & 0xff) as u8
}

/// Compose a full nlmsg_type for a conntrack message
#[must_use]
pub const fn ctnl_msg_type(msg_type: u8) -> u16 {
    ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | msg_type as u16
}

// Multicast groups for conntrack event delivery (bind-time nl_groups mask)
pub const NF_NETLINK_CONNTRACK_NEW: u32 = 0x1;
pub const NF_NETLINK_CONNTRACK_UPDATE: u32 = 0x2;
pub const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x4;
pub const NF_NETLINK_CONNTRACK_ALL: u32 =
    NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY;

// Top-level conntrack attributes (ctattr_type)
pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;
pub const CTA_STATUS: u16 = 3;
pub const CTA_PROTOINFO: u16 = 4;
pub const CTA_TIMEOUT: u16 = 7;
pub const CTA_MARK: u16 = 8;
pub const CTA_ID: u16 = 12;

// Nested under CTA_TUPLE_ORIG / CTA_TUPLE_REPLY (ctattr_tuple)
pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;

// Nested under CTA_TUPLE_IP (ctattr_ip)
pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;

// Nested under CTA_TUPLE_PROTO (ctattr_l4proto)
pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;

// Nested under CTA_PROTOINFO, then CTA_PROTOINFO_TCP
pub const CTA_PROTOINFO_TCP: u16 = 1;
pub const CTA_PROTOINFO_TCP_STATE: u16 = 1;

// Attribute type field: high bits are flags, low bits the type number
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

// Address families / protocols
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;
pub const IPPROTO_TCP: u8 = 6;

// Kernel conntrack TCP sub-states (enum tcp_conntrack).
// SYN_SENT2 shares value 9 with the legacy LISTEN name.
pub const TCP_CONNTRACK_NONE: u8 = 0;
pub const TCP_CONNTRACK_SYN_SENT: u8 = 1;
pub const TCP_CONNTRACK_SYN_RECV: u8 = 2;
pub const TCP_CONNTRACK_ESTABLISHED: u8 = 3;
pub const TCP_CONNTRACK_FIN_WAIT: u8 = 4;
pub const TCP_CONNTRACK_CLOSE_WAIT: u8 = 5;
pub const TCP_CONNTRACK_LAST_ACK: u8 = 6;
pub const TCP_CONNTRACK_TIME_WAIT: u8 = 7;
pub const TCP_CONNTRACK_CLOSE: u8 = 8;
pub const TCP_CONNTRACK_SYN_SENT2: u8 = 9;
pub const TCP_CONNTRACK_MAX: u8 = 10;
pub const TCP_CONNTRACK_IGNORE: u8 = 11;

// HELPER FUNCTIONS

/// Align length to 4-byte boundary
#[must_use]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Calculate Netlink message length (header + payload)
#[must_use]
pub const fn nlmsg_length(payload_len: usize) -> u32 {
    (std::mem::size_of::<NlMsgHdr>() + payload_len) as u32
}

/// Align attribute length to 4-byte boundary
#[must_use]
pub const fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Calculate attribute length (header + payload)
#[must_use]
pub const fn nla_length(payload_len: usize) -> u16 {
    (std::mem::size_of::<NlAttr>() + payload_len) as u16
}

// TESTS
