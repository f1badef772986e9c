// ============================================================================
// CRATE-LEVEL SCENARIO TESTS
// ============================================================================
// Each test walks a decoded conntrack notification sequence through the
// whole pipeline (reconciliation, snapshot projection, text rendering)
// and checks what a scraper would observe afterwards.

use crate::local_addrs::LocalAddresses;
use crate::metrics::MetricsSnapshot;
use crate::netlink::{ConntrackRecord, EventKind, RawTuple};
use crate::state::ConnectionState;
use crate::netlink::structures::TCP_CONNTRACK_ESTABLISHED;
use crate::table::ConnectionTable;
use std::net::Ipv4Addr;

const TCP: u8 = 6;

const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

fn local() -> LocalAddresses {
    LocalAddresses::from_addrs([LOCAL_IP])
}

fn table() -> ConnectionTable {
    ConnectionTable::new(local())
}

/// Record for a connection this host opened to REMOTE_IP:443.
fn outbound_record(event: EventKind, tcp_state: Option<u8>) -> ConntrackRecord {
    ConntrackRecord {
        event,
        l4proto: Some(TCP),
        original: Some(RawTuple {
            src_ip: LOCAL_IP,
            src_port: 51000,
            dst_ip: REMOTE_IP,
            dst_port: 443,
        }),
        reply: Some(RawTuple {
            src_ip: REMOTE_IP,
            src_port: 443,
            dst_ip: LOCAL_IP,
            dst_port: 51000,
        }),
        tcp_state,
    }
}

/// Record for a connection a remote peer opened to this host's port 22.
fn inbound_record(event: EventKind, tcp_state: Option<u8>) -> ConntrackRecord {
    ConntrackRecord {
        event,
        l4proto: Some(TCP),
        original: Some(RawTuple {
            src_ip: Ipv4Addr::new(198, 51, 100, 7),
            src_port: 40000,
            dst_ip: LOCAL_IP,
            dst_port: 22,
        }),
        reply: Some(RawTuple {
            src_ip: LOCAL_IP,
            src_port: 22,
            dst_ip: Ipv4Addr::new(198, 51, 100, 7),
            dst_port: 40000,
        }),
        tcp_state,
    }
}

fn snapshot(table: &ConnectionTable) -> MetricsSnapshot {
    MetricsSnapshot::from_connections(table.connections(), table.local_addresses())
}

#[test]
fn test_dump_row_becomes_scrapable_open_gauge() {
    // A dump row arrives as Update on the wire; after the rebuild remap
    // a scraper sees it as one open connection to the remote endpoint.
    let mut table = table();
    table.handle_record(
        outbound_record(EventKind::Update, Some(TCP_CONNTRACK_ESTABLISHED)),
        true,
    );

    assert_eq!(table.connections().len(), 1);
    assert_eq!(table.connections()[0].event(), EventKind::New);

    let snapshot = snapshot(&table);
    assert_eq!(snapshot.count(ConnectionState::Open, "93.184.216.34:443"), 1);
    assert!(snapshot
        .render()
        .contains("conntrack_open_connections_total{host=\"93.184.216.34:443\"} 1"));
}

#[test]
fn test_live_update_moves_gauge_between_classes() {
    let mut table = table();
    table.handle_record(
        outbound_record(EventKind::New, Some(1)), // SYN_SENT
        false,
    );
    assert_eq!(
        snapshot(&table).count(ConnectionState::Opening, "93.184.216.34:443"),
        1
    );

    table.handle_record(
        outbound_record(EventKind::Update, Some(TCP_CONNTRACK_ESTABLISHED)),
        false,
    );
    let after_established = snapshot(&table);
    assert_eq!(
        after_established.count(ConnectionState::Opening, "93.184.216.34:443"),
        0
    );
    assert_eq!(
        after_established.count(ConnectionState::Open, "93.184.216.34:443"),
        1
    );

    table.handle_record(
        outbound_record(EventKind::Update, Some(7)), // TIME_WAIT
        false,
    );
    let after_time_wait = snapshot(&table);
    assert_eq!(
        after_time_wait.count(ConnectionState::Open, "93.184.216.34:443"),
        0
    );
    assert_eq!(
        after_time_wait.count(ConnectionState::Closing, "93.184.216.34:443"),
        1
    );
}

#[test]
fn test_destroy_removes_gauge_entirely() {
    let mut table = table();
    table.handle_record(
        outbound_record(EventKind::Update, Some(TCP_CONNTRACK_ESTABLISHED)),
        true,
    );
    table.handle_record(outbound_record(EventKind::Destroy, Some(8)), false);

    assert!(table.connections().is_empty());

    let rendered = snapshot(&table).render();
    assert!(rendered.contains("# TYPE conntrack_open_connections_total gauge"));
    assert!(!rendered.contains("host="));
}

#[test]
fn test_short_lived_connection_cancels_out() {
    // New immediately followed by Destroy must leave nothing behind,
    // whatever states the two notifications carried.
    let mut table = table();
    table.handle_record(outbound_record(EventKind::New, Some(1)), false);
    table.handle_record(outbound_record(EventKind::Destroy, Some(8)), false);
    assert!(table.connections().is_empty());
}

#[test]
fn test_ignored_host_invisible_end_to_end() {
    let mut table = table();
    table.add_ignored_host("93.184.216.34:443");

    table.handle_record(
        outbound_record(EventKind::New, Some(TCP_CONNTRACK_ESTABLISHED)),
        false,
    );
    table.handle_record(outbound_record(EventKind::Destroy, Some(8)), false);
    assert!(table.connections().is_empty());

    // Traffic to other hosts on the same remote IP is still tracked.
    let mut other = outbound_record(EventKind::New, Some(TCP_CONNTRACK_ESTABLISHED));
    if let Some(original) = &mut other.original {
        original.dst_port = 8443;
    }
    if let Some(reply) = &mut other.reply {
        reply.src_port = 8443;
    }
    table.handle_record(other, false);
    assert_eq!(
        snapshot(&table).count(ConnectionState::Open, "93.184.216.34:8443"),
        1
    );
}

#[test]
fn test_inbound_connection_labeled_by_remote_peer() {
    // For a connection a peer opened to us, the gauge label must carry
    // the peer's address, not our listening socket.
    let mut table = table();
    table.handle_record(
        inbound_record(EventKind::Update, Some(TCP_CONNTRACK_ESTABLISHED)),
        true,
    );

    let snapshot = snapshot(&table);
    assert_eq!(
        snapshot.count(ConnectionState::Open, "198.51.100.7:40000"),
        1
    );
    assert_eq!(snapshot.count(ConnectionState::Open, "10.0.0.5:22"), 0);
}

#[test]
fn test_untracked_entry_tracked_but_not_exported() {
    // A record without protoinfo still occupies a table slot (a later
    // destroy must find it) but contributes to no gauge.
    let mut table = table();
    table.handle_record(outbound_record(EventKind::New, None), false);

    assert_eq!(table.connections().len(), 1);
    assert!(snapshot(&table).is_empty());

    table.handle_record(outbound_record(EventKind::Destroy, None), false);
    assert!(table.connections().is_empty());
}

#[test]
fn test_multiple_hosts_render_sorted() {
    let mut table = table();

    for (ip, port) in [
        (Ipv4Addr::new(198, 51, 100, 7), 80u16),
        (Ipv4Addr::new(93, 184, 216, 34), 443),
    ] {
        let record = ConntrackRecord {
            event: EventKind::New,
            l4proto: Some(TCP),
            original: Some(RawTuple {
                src_ip: LOCAL_IP,
                src_port: 51000,
                dst_ip: ip,
                dst_port: port,
            }),
            reply: Some(RawTuple {
                src_ip: ip,
                src_port: port,
                dst_ip: LOCAL_IP,
                dst_port: 51000,
            }),
            tcp_state: Some(TCP_CONNTRACK_ESTABLISHED),
        };
        table.handle_record(record, false);
    }

    let rendered = snapshot(&table).render();
    let first = rendered
        .find("host=\"93.184.216.34:443\"")
        .expect("first host present");
    let second = rendered
        .find("host=\"198.51.100.7:80\"")
        .expect("second host present");
    // Hosts sort lexicographically, so "198..." precedes "93...".
    assert!(second < first);
}
