//! Prometheus exposition
//!
//! Projects the connection table into an immutable `MetricsSnapshot`
//! (aggregate counts keyed by lifecycle class and remote host) and
//! serves it over HTTP in the Prometheus text format.
//!
//! Threading model mirrors the rest of the crate: the collector loop
//! owns the table, builds a fresh snapshot each cycle, and publishes it
//! through an `Arc<RwLock<MetricsSnapshot>>`. Worker threads only ever
//! take the read side, so a scrape never blocks collection for longer
//! than one snapshot swap.

// parking_lot::RwLock is faster than std::sync::RwLock (no poisoning overhead)
use parking_lot::RwLock;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use threadpool::ThreadPool;

use crate::connection::Connection;
use crate::local_addrs::LocalAddresses;
use crate::state::ConnectionState;

/// Gauge family name for one lifecycle class.
const fn family_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Opening => "conntrack_opening_connections_total",
        ConnectionState::Open => "conntrack_open_connections_total",
        ConnectionState::Closing => "conntrack_closing_connections_total",
        ConnectionState::Closed => "conntrack_closed_connections_total",
    }
}

const fn family_help(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Opening => {
            "How many connections to the remote host are currently opening?"
        }
        ConnectionState::Open => "How many open connections are there to the remote host?",
        ConnectionState::Closing => {
            "How many connections to the remote host are currently closing?"
        }
        ConnectionState::Closed => "How many connections to the remote host have recently closed?",
    }
}

// SNAPSHOT

/// Immutable aggregate view of the table at one instant: per remote
/// host, how many connections sit in each lifecycle class.
///
/// `BTreeMap` keeps hosts sorted, so two snapshots of the same table
/// contents render byte-identically.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    counts: BTreeMap<String, [u64; 4]>,
}

impl MetricsSnapshot {
    /// Aggregate the current table contents. Untracked entries (no TCP
    /// state on the wire) carry no lifecycle class and are skipped.
    #[must_use]
    pub fn from_connections(connections: &[Connection], local: &LocalAddresses) -> Self {
        let mut counts: BTreeMap<String, [u64; 4]> = BTreeMap::new();

        for connection in connections {
            if !connection.has_state() {
                continue;
            }
            let host = connection.remote_host(local);
            counts.entry(host).or_default()[connection.state() as usize] += 1;
        }

        Self { counts }
    }

    #[must_use]
    pub fn count(&self, state: ConnectionState, host: &str) -> u64 {
        self.counts
            .get(host)
            .map_or(0, |per_class| per_class[state as usize])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Render the snapshot in the Prometheus text exposition format.
    ///
    /// All four family headers are always present; sample lines appear
    /// only for (class, host) pairs with a nonzero count.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(256 + self.counts.len() * 64);

        for state in ConnectionState::ALL {
            let name = family_name(state);
            let _ = writeln!(out, "# HELP {name} {}", family_help(state));
            let _ = writeln!(out, "# TYPE {name} gauge");
            for (host, per_class) in &self.counts {
                let count = per_class[state as usize];
                if count > 0 {
                    let _ = writeln!(out, "{name}{{host=\"{host}\"}} {count}");
                }
            }
        }

        out
    }
}

// HTTP EXPOSITION

const LANDING_PAGE: &str = "<html><head><title>conntrack exporter</title></head>\
<body><h1>conntrack exporter</h1><p><a href=\"/metrics\">metrics</a></p></body></html>\n";

/// Handle one scrape connection in a worker thread.
fn handle_client(mut stream: TcpStream, snapshot: Arc<RwLock<MetricsSnapshot>>) {
    let mut buffer = [0_u8; 4096];

    if let Ok(bytes_read) = stream.read(&mut buffer) {
        let request = String::from_utf8_lossy(&buffer[..bytes_read]);

        if request.starts_with("GET /metrics") {
            let body = snapshot.read().render();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        } else if request.starts_with("GET / ") || request.starts_with("GET /\r") {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                LANDING_PAGE.len(),
                LANDING_PAGE
            );
            let _ = stream.write_all(response.as_bytes());
        } else {
            let not_found = "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n\
                 Not Found\n";
            let _ = stream.write_all(not_found.as_bytes());
        }
    }
    // Socket closes when the stream is dropped.
}

/// Bind the exporter endpoint and spawn its accept loop on a dedicated
/// thread, dispatching scrapes to a worker pool. The loop polls
/// `running` so the thread winds down after a shutdown request; the
/// returned handle joins it.
///
/// # Errors
///
/// Returns the bind error when the address or port is unavailable.
pub fn spawn_exporter(
    listen_address: &str,
    listen_port: u16,
    snapshot: Arc<RwLock<MetricsSnapshot>>,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(format!("{listen_address}:{listen_port}"))?;
    // Non-blocking so the accept loop can check the shutdown flag.
    listener.set_nonblocking(true)?;

    let handle = std::thread::spawn(move || {
        // Scrape handling is I/O-bound; a small pool covers concurrent
        // scrapers comfortably.
        let cpu_count = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(4);
        let pool = ThreadPool::new(cpu_count.clamp(2, 8));

        while running.load(AtomicOrdering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let snapshot = Arc::clone(&snapshot);
                    pool.execute(move || {
                        handle_client(stream, snapshot);
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(core::time::Duration::from_millis(100));
                }
                Err(e) => eprintln!("error accepting scrape connection: {e}"),
            }
        }

        pool.join();
    });

    Ok(handle)
}

// TESTS
