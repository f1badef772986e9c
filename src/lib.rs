// ============================================================================
// CONNTRACK EXPORTER LIBRARY
// ============================================================================
// Exposes the TCP connection states of a Linux host as Prometheus gauges.
// The kernel's connection tracking subsystem (conntrack) is the source of
// truth: a one-time full dump establishes the baseline and the ctnetlink
// multicast event stream keeps the in-memory table current from then on.
//
// === PIPELINE ===
// 1. netlink: raw NETLINK_NETFILTER transport, ctnetlink message codec,
//    and a kernel-side classic-BPF filter that drops non-TCP events
// 2. table: reconciles dump rows and live events into one consistent set
//    of connections (tuple-pair identity, last-applied wins)
// 3. metrics: projects the table into per-host lifecycle gauges and
//    serves them over HTTP in the Prometheus text format
//
// === THREADING MODEL ===
// The collector loop owns the table exclusively; scrape workers only read
// the published snapshot behind Arc<RwLock<>>. No lock is ever held across
// a syscall.

// === MODULE DECLARATIONS ===
pub mod connection;
pub mod local_addrs;
pub mod metrics;
pub mod netlink;
pub mod state;
pub mod table;

pub use connection::{Connection, Tuple};
pub use local_addrs::LocalAddresses;
pub use metrics::{spawn_exporter, MetricsSnapshot};
pub use state::{classify, ConnectionState, TcpState};
pub use table::{ConnectionTable, LogFormat, TableError};

// ============================================================================
// DEFAULTS
// ============================================================================

/// Address the exporter endpoint binds when none is given.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
/// Port the exporter endpoint binds when none is given (the conventional
/// node-exporter-family port).
pub const DEFAULT_LISTEN_PORT: u16 = 9100;

#[cfg(test)]
mod tests;
