// ============================================================================
// conntrack exporter - Main Entry Point
// ============================================================================
//
// Exposes the TCP connection states of this host as Prometheus gauges.
//
// Architecture:
// - Collector thread (this one): owns the connection table, drains the
//   conntrack event stream once per second and publishes a fresh snapshot
// - Exporter thread: accepts scrapes, dispatches them to a worker pool
// - Shared state: MetricsSnapshot wrapped in Arc<RwLock<>> so scrapes
//   never block collection for longer than one snapshot swap

// parking_lot::RwLock is faster than std::sync::RwLock (no poisoning overhead)
use parking_lot::RwLock;

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use conntrack_exporter::{
    spawn_exporter, ConnectionTable, LocalAddresses, LogFormat, MetricsSnapshot,
    DEFAULT_LISTEN_ADDRESS, DEFAULT_LISTEN_PORT,
};

// ============================================================================
// COMMAND LINE
// ============================================================================

struct Config {
    listen_address: String,
    listen_port: u16,
    ignored_hosts: Vec<String>,
    log_events: bool,
    log_format: LogFormat,
    debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            ignored_hosts: Vec::new(),
            log_events: false,
            log_format: LogFormat::default(),
            debug: false,
        }
    }
}

fn print_usage(program: &str) {
    println!("Usage: {program} [OPTIONS]");
    println!();
    println!("Exports the TCP connection states of this host as Prometheus gauges.");
    println!();
    println!("Options:");
    println!("  -l, --listen-address ADDR   address to serve metrics on (default: {DEFAULT_LISTEN_ADDRESS})");
    println!("  -p, --listen-port PORT      port to serve metrics on (default: {DEFAULT_LISTEN_PORT})");
    println!("  -i, --ignored-hosts HOSTS   remote hosts (ip:port) to exclude, separated");
    println!("                              by commas or whitespace");
    println!("  -e, --log-events            print each connection event to stdout");
    println!("  -f, --log-format FORMAT     event log format: 'netfilter' or 'json'");
    println!("                              (default: netfilter)");
    println!("  -d, --debug                 print tracking anomalies to stderr");
    println!("  -h, --help                  show this help and exit");
}

/// Parse the command line. `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Config>, String> {
    let mut config = Config::default();
    let mut index = 1;

    // Each flag taking a value consumes the next argument.
    let value = |index: &mut usize, flag: &str| -> Result<String, String> {
        *index += 1;
        args.get(*index)
            .cloned()
            .ok_or_else(|| format!("option '{flag}' requires a value"))
    };

    while index < args.len() {
        let arg = args[index].as_str();
        match arg {
            "-h" | "--help" => return Ok(None),
            "-l" | "--listen-address" => {
                config.listen_address = value(&mut index, arg)?;
            }
            "-p" | "--listen-port" => {
                let raw = value(&mut index, arg)?;
                config.listen_port = raw
                    .parse()
                    .map_err(|_| format!("invalid listen port '{raw}'"))?;
            }
            "-i" | "--ignored-hosts" => {
                let raw = value(&mut index, arg)?;
                config.ignored_hosts.extend(
                    raw.split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|token| !token.is_empty())
                        .map(str::to_string),
                );
            }
            "-e" | "--log-events" => config.log_events = true,
            "-f" | "--log-format" => {
                let raw = value(&mut index, arg)?;
                config.log_format = raw.parse()?;
            }
            "-d" | "--debug" => config.debug = true,
            other => return Err(format!("unknown option '{other}'")),
        }
        index += 1;
    }

    Ok(Some(config))
}

// ============================================================================
// MAIN FUNCTION - Collector Loop
// ============================================================================

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("conntrack-exporter", String::as_str);

    let config = match parse_args(&args) {
        Ok(Some(config)) => config,
        Ok(None) => {
            print_usage(program);
            return;
        }
        Err(message) => {
            eprintln!("{program}: {message}");
            eprintln!("try '{program} --help' for the option list");
            process::exit(1);
        }
    };

    let local = LocalAddresses::load(config.debug);
    if local.is_empty() {
        eprintln!("warning: no local IPv4 addresses found; remote host resolution degraded");
    }

    let mut table = ConnectionTable::new(local);
    table.enable_logging(config.log_events);
    table.set_log_format(config.log_format);
    table.enable_debugging(config.debug);
    for host in &config.ignored_hosts {
        table.add_ignored_host(host.clone());
    }

    if let Err(e) = table.attach() {
        eprintln!("failed to attach to conntrack: {e}");
        eprintln!("(this program needs CAP_NET_ADMIN; try running it as root)");
        process::exit(1);
    }

    let snapshot = Arc::new(RwLock::new(MetricsSnapshot::from_connections(
        table.connections(),
        table.local_addresses(),
    )));

    // Setup graceful shutdown on Ctrl-C
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, AtomicOrdering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let exporter = match spawn_exporter(
        &config.listen_address,
        config.listen_port,
        Arc::clone(&snapshot),
        Arc::clone(&running),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!(
                "failed to bind {}:{}: {e}",
                config.listen_address, config.listen_port
            );
            process::exit(1);
        }
    };

    println!(
        "serving metrics at http://{}:{}/metrics",
        config.listen_address, config.listen_port
    );

    // ========================================================================
    // COLLECTOR LOOP
    // ========================================================================
    while running.load(AtomicOrdering::SeqCst) {
        if let Err(e) = table.update() {
            // Recoverable: an overrun or transient socket error leaves
            // the table stale until the next successful drain.
            eprintln!("warning: event drain failed: {e}");
        }

        let fresh = MetricsSnapshot::from_connections(table.connections(), table.local_addresses());
        *snapshot.write() = fresh;

        std::thread::sleep(Duration::from_secs(1));
    }

    if exporter.join().is_err() {
        eprintln!("exporter thread panicked during shutdown");
    }
    println!("\nShutting down...");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("conntrack-exporter")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = parse_args(&args(&[])).unwrap().unwrap();
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert!(config.ignored_hosts.is_empty());
        assert!(!config.log_events);
        assert_eq!(config.log_format, LogFormat::Netfilter);
        assert!(!config.debug);
    }

    #[test]
    fn test_help_short_circuits() {
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
        assert!(parse_args(&args(&["-h"])).unwrap().is_none());
    }

    #[test]
    fn test_full_flag_set() {
        let config = parse_args(&args(&[
            "-l",
            "127.0.0.1",
            "-p",
            "9101",
            "-e",
            "-f",
            "json",
            "-d",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.listen_port, 9101);
        assert!(config.log_events);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.debug);
    }

    #[test]
    fn test_ignored_hosts_tokenization() {
        let config = parse_args(&args(&[
            "--ignored-hosts",
            "10.0.0.1:53, 10.0.0.2:53\t192.0.2.9:443",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(
            config.ignored_hosts,
            vec!["10.0.0.1:53", "10.0.0.2:53", "192.0.2.9:443"]
        );
    }

    #[test]
    fn test_repeated_ignored_hosts_accumulate() {
        let config = parse_args(&args(&["-i", "10.0.0.1:53", "-i", "10.0.0.2:53"]))
            .unwrap()
            .unwrap();
        assert_eq!(config.ignored_hosts.len(), 2);
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(parse_args(&args(&["--listen-port", "notaport"])).is_err());
        assert!(parse_args(&args(&["--log-format", "xml"])).is_err());
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
        assert!(parse_args(&args(&["--listen-port"])).is_err());
    }
}
