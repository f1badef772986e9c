//! Kernel-side TCP-only filter for conntrack sockets
//!
//! A classic-BPF socket filter attached with `SO_ATTACH_FILTER`, so
//! non-TCP conntrack records are dropped inside the kernel and never
//! cross into user space at all, on the dump channel and the event
//! channel alike.
//!
//! The program checks the canonical IPv4 conntrack message layout one
//! fixed offset at a time:
//!
//! ```text
//! offset 16  nfgenmsg family                 == AF_INET
//! offset 20  CTA_TUPLE_ORIG attr header      (type 1, nested)
//! offset 24  CTA_TUPLE_IP attr header        (type 1, nested, len 20)
//! offset 28  CTA_IP_V4_SRC  (8 bytes)
//! offset 36  CTA_IP_V4_DST  (8 bytes)
//! offset 44  CTA_TUPLE_PROTO attr header     (type 2, nested)
//! offset 48  CTA_PROTO_NUM attr header       (type 1)
//! offset 52  L4 protocol number              == IPPROTO_TCP ?
//! ```
//!
//! Every layout check that does not match ACCEPTS the message rather
//! than dropping it: the filter may only ever under-drop, and anything
//! it lets through that is not a complete IPv4 TCP record is discarded
//! by `Connection::from_record`. Only a message that provably carries a
//! non-TCP protocol number is dropped.
//!
//! Attribute headers are host-endian; the byte offsets below assume a
//! little-endian host (every supported deployment target).

use crate::netlink::structures::{AF_INET, IPPROTO_TCP};

// Classic BPF opcodes (BPF_LD|BPF_B|BPF_ABS, BPF_JMP|BPF_JEQ|BPF_K,
// BPF_RET|BPF_K).
const BPF_LD_B_ABS: u16 = 0x30;
const BPF_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

// Fixed offsets into the canonical IPv4 conntrack message.
const OFF_NFGEN_FAMILY: u32 = 16;
const OFF_TUPLE_ORIG_TYPE: u32 = 22; // low byte of nla_type
const OFF_TUPLE_ORIG_NESTED: u32 = 23; // high byte: NLA_F_NESTED
const OFF_TUPLE_IP_LEN: u32 = 24; // low byte of nla_len
const OFF_TUPLE_IP_TYPE: u32 = 26;
const OFF_TUPLE_IP_NESTED: u32 = 27;
const OFF_TUPLE_PROTO_TYPE: u32 = 46;
const OFF_TUPLE_PROTO_NESTED: u32 = 47;
const OFF_PROTO_NUM_TYPE: u32 = 50;
const OFF_PROTO_NUM_VALUE: u32 = 52;

const NESTED_HIGH_BYTE: u32 = 0x80;
// CTA_TUPLE_IP payload: two 8-byte IPv4 address attributes + own header.
const TUPLE_IP_V4_LEN: u32 = 20;

const ACCEPT: u32 = 0xffff_ffff;
const DROP: u32 = 0;

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Build the TCP-only filter program.
///
/// The returned instructions stay valid for `NetlinkSocket::attach_filter`,
/// which copies them into the kernel.
#[must_use]
pub fn tcp_only_filter() -> Vec<libc::sock_filter> {
    // Layout checks: a mismatch on any of these means "not the canonical
    // IPv4 shape", which accepts. The final protocol check is the only
    // one that drops.
    let layout_checks: [(u32, u32); 9] = [
        (OFF_NFGEN_FAMILY, AF_INET as u32),
        (OFF_TUPLE_ORIG_TYPE, 0x01),
        (OFF_TUPLE_ORIG_NESTED, NESTED_HIGH_BYTE),
        (OFF_TUPLE_IP_LEN, TUPLE_IP_V4_LEN),
        (OFF_TUPLE_IP_TYPE, 0x01),
        (OFF_TUPLE_IP_NESTED, NESTED_HIGH_BYTE),
        (OFF_TUPLE_PROTO_TYPE, 0x02),
        (OFF_TUPLE_PROTO_NESTED, NESTED_HIGH_BYTE),
        (OFF_PROTO_NUM_TYPE, 0x01),
    ];

    // Two instructions per check plus the protocol check plus the two
    // returns.
    let total = 2 * layout_checks.len() + 2 + 2;
    let accept_idx = total - 2;
    let drop_idx = total - 1;
    let mut prog = Vec::with_capacity(total);

    for (offset, expected) in layout_checks {
        prog.push(insn(BPF_LD_B_ABS, 0, 0, offset));
        let jeq_idx = prog.len();
        // Match: fall through to the next check. Mismatch: accept.
        let to_accept = (accept_idx - jeq_idx - 1) as u8;
        prog.push(insn(BPF_JEQ_K, 0, to_accept, expected));
    }

    prog.push(insn(BPF_LD_B_ABS, 0, 0, OFF_PROTO_NUM_VALUE));
    prog.push(insn(BPF_JEQ_K, 0, 1, IPPROTO_TCP as u32));
    prog.push(insn(BPF_RET_K, 0, 0, ACCEPT));
    prog.push(insn(BPF_RET_K, 0, 0, DROP));

    debug_assert_eq!(prog.len(), total);
    prog
}

// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::structures::*;

    // Minimal classic-BPF interpreter covering the three opcodes the
    // program uses, so the filter can be executed against real message
    // bytes without a kernel.
    fn run_filter(prog: &[libc::sock_filter], data: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0usize;
        loop {
            let i = &prog[pc];
            match i.code {
                BPF_LD_B_ABS => {
                    // Out-of-bounds load terminates with drop, matching
                    // kernel behavior.
                    match data.get(i.k as usize) {
                        Some(&byte) => acc = byte as u32,
                        None => return 0,
                    }
                    pc += 1;
                }
                BPF_JEQ_K => {
                    let jump = if acc == i.k { i.jt } else { i.jf };
                    pc += 1 + jump as usize;
                }
                BPF_RET_K => return i.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    // Emit the canonical kernel layout the filter is written against.
    fn canonical_event(family: u8, proto: u8) -> Vec<u8> {
        let mut data = Vec::new();
        // netlink header
        data.extend_from_slice(&0u32.to_ne_bytes());
        data.extend_from_slice(&ctnl_msg_type(IPCTNL_MSG_CT_NEW).to_ne_bytes());
        data.extend_from_slice(&(NLM_F_CREATE | NLM_F_EXCL).to_ne_bytes());
        data.extend_from_slice(&1u32.to_ne_bytes());
        data.extend_from_slice(&0u32.to_ne_bytes());
        // nfgenmsg
        data.push(family);
        data.push(NFNETLINK_V0);
        data.extend_from_slice(&0u16.to_ne_bytes());
        // CTA_TUPLE_ORIG nest: ip nest (20 bytes) + proto nest
        let proto_nest_len: u16 = 4 + 8; // header + CTA_PROTO_NUM attr (aligned)
        let orig_len: u16 = 4 + 20 + proto_nest_len;
        data.extend_from_slice(&orig_len.to_ne_bytes());
        data.extend_from_slice(&(CTA_TUPLE_ORIG | NLA_F_NESTED).to_ne_bytes());
        // CTA_TUPLE_IP
        data.extend_from_slice(&20u16.to_ne_bytes());
        data.extend_from_slice(&(CTA_TUPLE_IP | NLA_F_NESTED).to_ne_bytes());
        data.extend_from_slice(&8u16.to_ne_bytes());
        data.extend_from_slice(&CTA_IP_V4_SRC.to_ne_bytes());
        data.extend_from_slice(&[10, 0, 0, 5]);
        data.extend_from_slice(&8u16.to_ne_bytes());
        data.extend_from_slice(&CTA_IP_V4_DST.to_ne_bytes());
        data.extend_from_slice(&[93, 184, 216, 34]);
        // CTA_TUPLE_PROTO
        data.extend_from_slice(&proto_nest_len.to_ne_bytes());
        data.extend_from_slice(&(CTA_TUPLE_PROTO | NLA_F_NESTED).to_ne_bytes());
        data.extend_from_slice(&5u16.to_ne_bytes());
        data.extend_from_slice(&CTA_PROTO_NUM.to_ne_bytes());
        data.push(proto);
        data.extend_from_slice(&[0, 0, 0]); // attribute padding

        let len = data.len() as u32;
        data[0..4].copy_from_slice(&len.to_ne_bytes());
        data
    }

    #[test]
    fn test_program_shape() {
        let prog = tcp_only_filter();
        assert_eq!(prog.len(), 2 * 9 + 4);
        // Every jump must land inside the program.
        for (idx, i) in prog.iter().enumerate() {
            if i.code == BPF_JEQ_K {
                assert!(idx + 1 + (i.jt as usize) < prog.len());
                assert!(idx + 1 + (i.jf as usize) < prog.len());
            }
        }
        // Terminated by accept + drop returns.
        assert_eq!(prog[prog.len() - 2].code, BPF_RET_K);
        assert_eq!(prog[prog.len() - 2].k, ACCEPT);
        assert_eq!(prog[prog.len() - 1].code, BPF_RET_K);
        assert_eq!(prog[prog.len() - 1].k, DROP);
    }

    #[test]
    fn test_accepts_tcp() {
        let prog = tcp_only_filter();
        let data = canonical_event(AF_INET, IPPROTO_TCP);
        assert_eq!(run_filter(&prog, &data), ACCEPT);
    }

    #[test]
    fn test_drops_udp() {
        let prog = tcp_only_filter();
        let data = canonical_event(AF_INET, 17); // IPPROTO_UDP
        assert_eq!(run_filter(&prog, &data), DROP);
    }

    #[test]
    fn test_accepts_unrecognized_layout() {
        // IPv6 records do not match the IPv4 layout checks; the filter
        // must pass them through for the client-side guard to discard.
        let prog = tcp_only_filter();
        let data = canonical_event(AF_INET6, 17);
        assert_eq!(run_filter(&prog, &data), ACCEPT);
    }
}
