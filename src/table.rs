//! Connection table reconciliation engine
//!
//! Owns the in-memory set of tracked connections and keeps it consistent
//! with the kernel's conntrack table from two sources: a one-time full
//! dump at attach time, and the continuous event stream thereafter.
//!
//! Consistency rules:
//! - at most one entry per identity (original + reply tuple pair); an
//!   incoming record always removes its identity match before the event
//!   type decides what the table should hold afterwards, so the most
//!   recently processed notification wins regardless of arrival order
//! - dump rows decode as `Update` on the wire but describe entries that
//!   simply exist, so they are remapped to `New` during a rebuild
//! - there is no periodic re-dump after startup; steady-state
//!   correctness relies on the event channel not dropping notifications
//!   (hence the enlarged socket buffer in the transport)
//!
//! The table is not synchronized: it belongs to the single collector
//! loop, which reconciles, snapshots, and only hands the immutable
//! snapshot to other threads.

use crate::connection::Connection;
use crate::local_addrs::LocalAddresses;
use crate::netlink::socket::RECV_BUFFER_SIZE;
use crate::netlink::structures::NF_NETLINK_CONNTRACK_ALL;
use crate::netlink::{
    build_dump_request, parse_conntrack_messages, tcp_only_filter, ConntrackRecord, EventKind,
    MessageError, NetlinkSocket, ParsedMessage, SocketError,
};

// ERROR TYPE

/// Errors from table/transport interaction
#[derive(Debug)]
pub enum TableError {
    /// Socket-level failure (open, bind, filter attach, send/recv)
    Socket(SocketError),
    /// Structurally invalid data during the startup dump
    Message(MessageError),
    /// Kernel rejected the dump request (positive errno)
    DumpRejected(i32),
    /// An operation needing the transport ran before `attach()`
    NotAttached,
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::Socket(e) => write!(f, "netlink socket error: {e}"),
            TableError::Message(e) => write!(f, "conntrack message error: {e}"),
            TableError::DumpRejected(errno) => {
                write!(f, "kernel rejected conntrack dump (errno {errno})")
            }
            TableError::NotAttached => write!(f, "connection table is not attached"),
        }
    }
}

impl std::error::Error for TableError {}

impl From<SocketError> for TableError {
    fn from(e: SocketError) -> Self {
        TableError::Socket(e)
    }
}

impl From<MessageError> for TableError {
    fn from(e: MessageError) -> Self {
        TableError::Message(e)
    }
}

// LOG FORMAT

/// Rendering used for per-notification event logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// conntrack-tool-style line
    #[default]
    Netfilter,
    /// structured single-line JSON
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "netfilter" => Ok(LogFormat::Netfilter),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{other}' (expected 'netfilter' or 'json')"
            )),
        }
    }
}

// CONNECTION TABLE

/// The reconciliation engine
pub struct ConnectionTable {
    connections: Vec<Connection>,
    ignored_hosts: Vec<String>,
    rebuilding: bool,
    log_events: bool,
    log_format: LogFormat,
    debug: bool,
    local: LocalAddresses,
    /// Dedicated request/response channel for full-table dumps; a dump
    /// in progress never contends with live delivery.
    dump_socket: Option<NetlinkSocket>,
    /// Multicast-subscribed, non-blocking channel for live events.
    event_socket: Option<NetlinkSocket>,
    dump_seq: u32,
}

impl ConnectionTable {
    #[must_use]
    pub fn new(local: LocalAddresses) -> Self {
        Self {
            connections: Vec::new(),
            ignored_hosts: Vec::new(),
            rebuilding: false,
            log_events: false,
            log_format: LogFormat::default(),
            debug: false,
            local,
            dump_socket: None,
            event_socket: None,
            dump_seq: 0,
        }
    }

    pub fn enable_logging(&mut self, enable: bool) {
        self.log_events = enable;
    }

    pub fn set_log_format(&mut self, format: LogFormat) {
        self.log_format = format;
    }

    pub fn enable_debugging(&mut self, enable: bool) {
        self.debug = enable;
    }

    /// Register a remote host (`ip:port`, exact match) whose
    /// notifications are discarded before they can touch the table.
    pub fn add_ignored_host(&mut self, host: impl Into<String>) {
        self.ignored_hosts.push(host.into());
    }

    /// Open both transport channels and load the initial table state.
    ///
    /// Idempotent: a second call on an attached table does nothing.
    /// Opens the dump channel and the event channel (subscribed to
    /// new/update/destroy groups), attaches the kernel-side TCP filter
    /// to both, puts the event channel into non-blocking mode, and runs
    /// the one-time full resync so the table starts from a complete
    /// baseline. Events arriving while the dump runs queue up in the
    /// event socket buffer and are reconciled by the first `update()`,
    /// after the dump rows, so the most recent state still wins.
    ///
    /// # Errors
    ///
    /// Every failure here is fatal for the process: socket open/bind,
    /// filter attach, non-blocking mode, or the dump itself.
    pub fn attach(&mut self) -> Result<(), TableError> {
        if self.event_socket.is_some() {
            return Ok(());
        }

        let filter = tcp_only_filter();

        let dump_socket = NetlinkSocket::new(0)?;
        dump_socket.attach_filter(&filter)?;

        let event_socket = NetlinkSocket::new(NF_NETLINK_CONNTRACK_ALL)?;
        event_socket.attach_filter(&filter)?;
        event_socket.set_nonblocking()?;

        self.dump_socket = Some(dump_socket);
        self.event_socket = Some(event_socket);

        // Only a successfully rebuilt table counts as attached: when the
        // dump fails, drop both sockets again so a retried attach()
        // starts over instead of reporting success with no baseline.
        if let Err(e) = self.rebuild() {
            self.dump_socket = None;
            self.event_socket = None;
            return Err(e);
        }
        Ok(())
    }

    /// Drain every immediately available live notification and reconcile
    /// each one. Returns as soon as nothing more is pending; never
    /// blocks waiting for events, so the collector loop's cadence does
    /// not depend on notification timing.
    ///
    /// # Errors
    ///
    /// Returns `TableError` on socket failure or when called before
    /// `attach()`. Two conditions are soft anomalies that do not abort
    /// the drain: a malformed event datagram (debug-logged and skipped)
    /// and a socket buffer overrun (`ENOBUFS`, warned about and drained
    /// past, since the socket stays usable).
    pub fn update(&mut self) -> Result<(), TableError> {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let len = {
                let socket = self.event_socket.as_ref().ok_or(TableError::NotAttached)?;
                match socket.recv_nonblocking(&mut buffer) {
                    Ok(Some(len)) => len,
                    Ok(None) => return Ok(()), // drained
                    Err(e) if e.is_buffer_overrun() => {
                        // The entries we missed cannot be recovered
                        // without a re-dump, so make the loss visible,
                        // then keep draining what did arrive.
                        eprintln!("warning: event channel overran, notifications were dropped");
                        continue;
                    }
                    Err(e) => return Err(TableError::Socket(e)),
                }
            };

            let messages = match parse_conntrack_messages(&buffer[..len]) {
                Ok(messages) => messages,
                Err(e) => {
                    if self.debug {
                        eprintln!("[debug] dropping malformed event datagram: {e}");
                    }
                    continue;
                }
            };

            for message in messages {
                match message {
                    ParsedMessage::Conntrack(record) => self.handle_record(record, false),
                    ParsedMessage::Error(errno) if errno != 0 => {
                        // Error reports are not expected on a multicast
                        // subscription; log and keep going.
                        eprintln!("warning: kernel reported error {errno} on event channel");
                    }
                    ParsedMessage::Error(_) | ParsedMessage::Done => {}
                }
            }
        }
    }

    /// Current table contents, for the exporter to project into a
    /// snapshot.
    #[must_use]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    #[must_use]
    pub fn local_addresses(&self) -> &LocalAddresses {
        &self.local
    }

    /// One-time full resync: clear the table and repopulate it from a
    /// kernel dump, suppressing event logs while it runs.
    fn rebuild(&mut self) -> Result<(), TableError> {
        self.connections.clear();
        self.rebuilding = true;
        let result = self.run_dump();
        self.rebuilding = false;
        result
    }

    fn run_dump(&mut self) -> Result<(), TableError> {
        self.dump_seq = self.dump_seq.wrapping_add(1);
        let request = build_dump_request(self.dump_seq);

        let data = {
            let socket = self.dump_socket.as_ref().ok_or(TableError::NotAttached)?;
            socket.send(&request)?;
            socket.recv_dump()?
        };

        for message in parse_conntrack_messages(&data)? {
            match message {
                // Dump rows decode as Update (no create flags on the
                // wire) but enumerate entries that simply exist; none of
                // them is a transition from previously seen state.
                ParsedMessage::Conntrack(record) => self.handle_record(record, true),
                ParsedMessage::Error(errno) if errno != 0 => {
                    return Err(TableError::DumpRejected(errno));
                }
                ParsedMessage::Error(_) => {}
                ParsedMessage::Done => break,
            }
        }

        Ok(())
    }

    /// Construct a connection from one decoded record and reconcile it.
    /// Non-TCP and incomplete records are discarded here (the kernel
    /// filter already drops what it can prove non-TCP).
    pub(crate) fn handle_record(&mut self, record: ConntrackRecord, from_dump: bool) {
        let Some(connection) = Connection::from_record(&record) else {
            if self.debug {
                eprintln!("[debug] discarding non-TCP or incomplete conntrack record");
            }
            return;
        };

        let connection = if from_dump && connection.event() == EventKind::Update {
            connection.with_event(EventKind::New)
        } else {
            connection
        };

        self.reconcile(connection);
    }

    /// Apply one notification to the table.
    pub(crate) fn reconcile(&mut self, connection: Connection) {
        let remote_host = connection.remote_host(&self.local);

        if self.is_ignored(&remote_host) {
            if self.debug {
                eprintln!(
                    "[debug] ignoring {} notification for {remote_host}",
                    connection.event().label()
                );
            }
            return;
        }

        if self.log_events && !self.rebuilding {
            match self.log_format {
                LogFormat::Netfilter => println!("{}", connection.to_netfilter_string()),
                LogFormat::Json => println!("{}", connection.to_json_string(&self.local)),
            }
        }

        // Remove any identity match up front, whatever the event type.
        // The match below then only decides what the table should hold
        // afterwards, which is what makes last-applied-wins hold.
        let existing = self
            .connections
            .iter()
            .position(|entry| *entry == connection);
        if let Some(index) = existing {
            self.connections.remove(index);
        }

        match connection.event() {
            EventKind::New | EventKind::Update => {
                if self.debug && !self.rebuilding {
                    if connection.event() == EventKind::New && existing.is_some() {
                        eprintln!("[debug] new notification matched an existing entry ({remote_host})");
                    }
                    if connection.event() == EventKind::Update && existing.is_none() {
                        eprintln!("[debug] update notification matched no entry ({remote_host})");
                    }
                }
                self.connections.push(connection);
            }
            EventKind::Destroy => {
                if self.debug && existing.is_none() {
                    eprintln!("[debug] destroy notification matched no entry ({remote_host})");
                }
            }
            EventKind::Unknown => {}
        }
    }

    fn is_ignored(&self, remote_host: &str) -> bool {
        self.ignored_hosts.iter().any(|host| host == remote_host)
    }
}

// TESTS
