//! Netlink socket management
//!
//! Safe wrapper around the `AF_NETLINK`/`NETLINK_NETFILTER` socket
//! lifecycle. The raw file descriptor is owned by `NetlinkSocket` and is
//! closed on drop, so a handle can never leak across an error path.
//!
//! Two sockets are used per process: one bound with no multicast groups
//! for on-demand table dumps, and one bound to the conntrack event groups
//! for continuous notification delivery. Keeping them separate means a
//! dump in progress never contends with live events on the same channel.
//!
//! Linux only: netlink is a Linux-specific kernel interface.

use std::io;
use std::os::unix::io::RawFd;

/// Receive buffer size for both sockets.
///
/// Conntrack events burst under connection churn; the kernel drops
/// notifications that do not fit the socket buffer, and a dropped
/// notification is unrecoverable for the table (there is no periodic
/// resync after startup). 1 MiB matches what conntrack tooling asks for.
pub const RECV_BUFFER_SIZE: usize = 1 << 20;

/// Errors from Netlink socket syscalls, with call-site context
#[derive(Debug)]
pub struct SocketError {
    message: String,
    raw_os_error: Option<i32>,
}

impl SocketError {
    fn new(message: String) -> Self {
        Self {
            message,
            raw_os_error: None,
        }
    }

    fn from_io_error(context: &str, err: io::Error) -> Self {
        Self {
            message: format!("{context}: {err}"),
            raw_os_error: err.raw_os_error(),
        }
    }

    /// True when the kernel reported `ENOBUFS`: the socket buffer
    /// overran and notifications were dropped. The socket itself is
    /// still usable, so callers may keep draining after logging the
    /// loss.
    #[must_use]
    pub fn is_buffer_overrun(&self) -> bool {
        self.raw_os_error == Some(libc::ENOBUFS)
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SocketError {}

/// `NETLINK_NETFILTER` socket with automatic cleanup
///
/// ```no_run
/// use conntrack_exporter::netlink::socket::NetlinkSocket;
/// use conntrack_exporter::netlink::structures::NF_NETLINK_CONNTRACK_ALL;
///
/// // Dump channel: no multicast groups, request/response only.
/// let dump = NetlinkSocket::new(0)?;
/// // Event channel: subscribed to new/update/destroy notifications.
/// let events = NetlinkSocket::new(NF_NETLINK_CONNTRACK_ALL)?;
/// events.set_nonblocking()?;
/// # Ok::<(), conntrack_exporter::netlink::socket::SocketError>(())
/// ```
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open a `NETLINK_NETFILTER` socket and bind it to `groups`
    /// (a `NF_NETLINK_CONNTRACK_*` bitmask, or 0 for a plain
    /// request/response channel).
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `socket()`, `bind()` or
    /// `setsockopt(SO_RCVBUF)` fails. Opening conntrack sockets requires
    /// `CAP_NET_ADMIN`.
    pub fn new(groups: u32) -> Result<Self, SocketError> {
        unsafe {
            // SAFETY: plain libc syscall; return value is checked below.
            let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_NETFILTER);
            if fd < 0 {
                let err = io::Error::last_os_error();
                return Err(SocketError::from_io_error("socket() failed", err));
            }

            // Bind with the multicast group mask. nl_pid = 0 lets the
            // kernel assign a unique port id per socket, which matters
            // here because the process owns two of them.
            //
            // SAFETY: zeroed() is valid for the POD sockaddr_nl, and
            // sockaddr_nl casts to sockaddr per the sockets API contract.
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0;
            addr.nl_groups = groups;

            let ret = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::from_io_error("bind() failed", err));
            }

            // Enlarge the receive buffer so event bursts are not dropped
            // by the kernel before we get a chance to drain them.
            let rcvbuf: libc::c_int = RECV_BUFFER_SIZE as libc::c_int;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::from_io_error(
                    "setsockopt(SO_RCVBUF) failed",
                    err,
                ));
            }

            Ok(Self { fd })
        }
    }

    /// Put the socket into non-blocking mode.
    ///
    /// The event channel must never stall the collector loop; with
    /// `O_NONBLOCK` set, a drain simply ends on `EWOULDBLOCK`.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if either `fcntl()` call fails.
    pub fn set_nonblocking(&self) -> Result<(), SocketError> {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags < 0 {
                let err = io::Error::last_os_error();
                return Err(SocketError::from_io_error("fcntl(F_GETFL) failed", err));
            }
            let ret = libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            if ret < 0 {
                let err = io::Error::last_os_error();
                return Err(SocketError::from_io_error("fcntl(F_SETFL) failed", err));
            }
        }
        Ok(())
    }

    /// Attach a classic-BPF socket filter so filtered records are dropped
    /// kernel-side and never cross into user space.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `setsockopt(SO_ATTACH_FILTER)` fails.
    pub fn attach_filter(&self, prog: &[libc::sock_filter]) -> Result<(), SocketError> {
        let fprog = libc::sock_fprog {
            len: prog.len() as libc::c_ushort,
            filter: prog.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: fprog points at `prog`, which outlives the call; the
        // kernel copies the program during setsockopt.
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::sock_fprog>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error(
                "setsockopt(SO_ATTACH_FILTER) failed",
                err,
            ));
        }
        Ok(())
    }

    /// Send request bytes to the kernel.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` on `sendto()` failure or a short send.
    pub fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0; // destination: kernel

            // SAFETY: data.as_ptr() is valid for data.len() bytes.
            let ret = libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );

            if ret < 0 {
                let err = io::Error::last_os_error();
                return Err(SocketError::from_io_error("sendto() failed", err));
            }
            if ret as usize != data.len() {
                return Err(SocketError::new(format!(
                    "short send: sent {} of {} bytes",
                    ret,
                    data.len()
                )));
            }
            Ok(())
        }
    }

    /// Receive one datagram into `buffer`, blocking until data arrives.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `recv()` fails.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        // SAFETY: buffer.as_mut_ptr() is valid for buffer.len() bytes.
        let ret = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error("recv() failed", err));
        }
        Ok(ret as usize)
    }

    /// Receive one datagram without blocking.
    ///
    /// Returns `Ok(None)` when no datagram is immediately available,
    /// which is how the caller knows a drain is complete.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` on any failure other than `EWOULDBLOCK`.
    pub fn recv_nonblocking(&self, buffer: &mut [u8]) -> Result<Option<usize>, SocketError> {
        // SAFETY: as in recv(); MSG_DONTWAIT makes this call non-blocking
        // even if O_NONBLOCK were ever cleared on the fd.
        let ret = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(SocketError::from_io_error("recv() failed", err));
        }
        Ok(Some(ret as usize))
    }

    /// Receive a complete multi-part dump response, concatenating
    /// datagrams until a terminal message arrives: `NLMSG_DONE` for a
    /// completed dump, or `NLMSG_ERROR` when the kernel rejects the
    /// request (a rejected dump gets a lone error datagram and no
    /// `NLMSG_DONE`; the parser surfaces the errno to the caller).
    ///
    /// Blocking by design: a table dump is answered promptly by the
    /// kernel and happens exactly once, at startup.
    ///
    /// # Errors
    ///
    /// Returns `SocketError` if `recv()` fails or the response exceeds a
    /// 64 MiB sanity limit.
    pub fn recv_dump(&self) -> Result<Vec<u8>, SocketError> {
        let mut all_data = Vec::with_capacity(RECV_BUFFER_SIZE);
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let bytes_received = self.recv(&mut buffer)?;
            let chunk = &buffer[..bytes_received];
            all_data.extend_from_slice(chunk);

            if Self::contains_terminal_message(chunk) {
                break;
            }

            // Guard against a runaway response filling memory.
            if all_data.len() > 64 << 20 {
                return Err(SocketError::new(
                    "dump response too large (> 64MB)".to_string(),
                ));
            }
        }

        Ok(all_data)
    }

    /// Check whether a datagram contains a message that ends a dump:
    /// `NLMSG_DONE`, or `NLMSG_ERROR` for a rejected request.
    fn contains_terminal_message(data: &[u8]) -> bool {
        use crate::netlink::structures::{nlmsg_align, NlMsgHdr, NLMSG_DONE, NLMSG_ERROR};

        let header_size = std::mem::size_of::<NlMsgHdr>();
        let mut offset = 0;
        while offset + header_size <= data.len() {
            // SAFETY: bounds checked above; NlMsgHdr is repr(C) POD and
            // netlink guarantees 4-byte message alignment.
            let nlh = unsafe { &*(data[offset..].as_ptr() as *const NlMsgHdr) };
            if nlh.nlmsg_type == NLMSG_DONE || nlh.nlmsg_type == NLMSG_ERROR {
                return true;
            }
            let msg_len = nlh.nlmsg_len as usize;
            if msg_len < header_size {
                break;
            }
            offset += nlmsg_align(msg_len);
        }
        false
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // Errors cannot be propagated from drop; double-close is the only
        // failure mode and self.fd is owned uniquely.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// TESTS
