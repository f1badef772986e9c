//! Local address registry
//!
//! The set of IPv4 addresses bound to this machine's interfaces, used to
//! decide which end of a tracked connection is the remote one. Built
//! once at startup by the composition root and passed to whoever needs
//! it, so tests can inject a fixed set instead of the real interfaces.
//!
//! The set is never refreshed: an interface reconfigured at runtime is
//! not picked up until restart. Accepted trade-off for a collector that
//! is cheap to restart.

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Immutable set of locally bound IPv4 addresses
#[derive(Debug, Clone, Default)]
pub struct LocalAddresses {
    addrs: HashSet<Ipv4Addr>,
}

impl LocalAddresses {
    /// Enumerate the machine's interfaces via `getifaddrs(3)` and collect
    /// every bound IPv4 address.
    ///
    /// Enumeration failure is non-fatal: it logs a warning and returns an
    /// empty set, which degrades remote-host resolution to its reply-
    /// tuple fallback but never stops the exporter.
    #[must_use]
    pub fn load(debug: bool) -> Self {
        let mut addrs = HashSet::new();

        unsafe {
            let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
            // SAFETY: getifaddrs allocates the list; freed below on every
            // path that got a non-null list.
            if libc::getifaddrs(&mut ifap) != 0 {
                let err = std::io::Error::last_os_error();
                eprintln!("warning: could not enumerate network interfaces: {err}");
                return Self { addrs };
            }

            let mut cursor = ifap;
            while !cursor.is_null() {
                let entry = &*cursor;
                let sa = entry.ifa_addr;
                if !sa.is_null() && (*sa).sa_family == libc::AF_INET as libc::sa_family_t {
                    // SAFETY: sa_family == AF_INET guarantees the pointer
                    // refers to a sockaddr_in.
                    let sin = &*(sa as *const libc::sockaddr_in);
                    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                    addrs.insert(ip);
                }
                cursor = entry.ifa_next;
            }

            libc::freeifaddrs(ifap);
        }

        if debug {
            let mut listed: Vec<String> = addrs.iter().map(Ipv4Addr::to_string).collect();
            listed.sort();
            eprintln!("[debug] local addresses: {}", listed.join(", "));
        }

        Self { addrs }
    }

    /// Build a registry from a fixed address set (tests, mostly).
    #[must_use]
    pub fn from_addrs<I: IntoIterator<Item = Ipv4Addr>>(addrs: I) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.addrs.contains(&ip)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

// TESTS
