//! Backend port allocation
//!
//! Ports are handed out in ascending order from a configured range. A port is free
//! when nothing answers a TCP connect on localhost and no existing route claims it.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Not enough free ports in the range
#[derive(Debug, Error, PartialEq, Eq)]
#[error("could not find {requested} available ports in the range {start}-{end} (found {found})")]
pub struct PortExhausted {
    pub requested: usize,
    pub found: usize,
    pub start: u16,
    pub end: u16,
}

/// Answers "is anything listening on this port?"
pub trait PortProbe {
    fn is_listening(&self, port: u16) -> bool;
}

/// Probes by attempting a TCP connection to 127.0.0.1 with a bounded timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl PortProbe for TcpProbe {
    fn is_listening(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// Scans a half-open port range (`start..end`) for free ports
#[derive(Debug, Clone)]
pub struct PortAllocator<P = TcpProbe> {
    probe: P,
    start: u16,
    end: u16,
}

impl PortAllocator<TcpProbe> {
    pub fn new(start: u16, end: u16, probe_timeout: Duration) -> Self {
        Self::with_probe(start, end, TcpProbe::new(probe_timeout))
    }
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn with_probe(start: u16, end: u16, probe: P) -> Self {
        Self { probe, start, end }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Allocate `count` ports from the configured range
    pub fn allocate(&self, count: usize, exclude: &BTreeSet<u16>) -> Result<Vec<u16>, PortExhausted> {
        allocate(&self.probe, self.start, self.end, count, exclude)
    }
}

/// Return the first `count` ports in `start..end` that are neither excluded nor
/// answering on localhost. Either all requested ports are returned or none.
pub fn allocate(
    probe: &impl PortProbe,
    start: u16,
    end: u16,
    count: usize,
    exclude: &BTreeSet<u16>,
) -> Result<Vec<u16>, PortExhausted> {
    let mut ports = Vec::with_capacity(count);
    if count == 0 {
        return Ok(ports);
    }

    for port in start..end {
        if exclude.contains(&port) {
            continue;
        }
        if probe.is_listening(port) {
            debug!(port, "Port is bound, skipping");
            continue;
        }
        ports.push(port);
        if ports.len() == count {
            return Ok(ports);
        }
    }

    Err(PortExhausted {
        requested: count,
        found: ports.len(),
        start,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::TcpListener;

    /// Probe backed by a fixed set of occupied ports, recording what it was asked
    struct FakeProbe {
        occupied: BTreeSet<u16>,
        probed: RefCell<Vec<u16>>,
    }

    impl FakeProbe {
        fn new(occupied: impl IntoIterator<Item = u16>) -> Self {
            Self {
                occupied: occupied.into_iter().collect(),
                probed: RefCell::new(Vec::new()),
            }
        }
    }

    impl PortProbe for FakeProbe {
        fn is_listening(&self, port: u16) -> bool {
            self.probed.borrow_mut().push(port);
            self.occupied.contains(&port)
        }
    }

    #[test]
    fn test_skips_bound_and_excluded_ports() {
        let probe = FakeProbe::new([8000]);
        let exclude = BTreeSet::from([8001, 8002]);

        let ports = allocate(&probe, 8000, 8010, 2, &exclude).unwrap();
        assert_eq!(ports, vec![8003, 8004]);
    }

    #[test]
    fn test_excluded_ports_are_not_probed() {
        let probe = FakeProbe::new([]);
        let exclude = BTreeSet::from([8000]);

        allocate(&probe, 8000, 8002, 1, &exclude).unwrap();
        assert_eq!(*probe.probed.borrow(), vec![8001]);
    }

    #[test]
    fn test_stops_once_count_reached() {
        let probe = FakeProbe::new([]);
        allocate(&probe, 8000, 9000, 3, &BTreeSet::new()).unwrap();
        assert_eq!(probe.probed.borrow().len(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let probe = FakeProbe::new([8000]);
        let exclude = BTreeSet::from([8001, 8002]);

        let err = allocate(&probe, 8000, 8004, 2, &exclude).unwrap_err();
        assert_eq!(
            err,
            PortExhausted {
                requested: 2,
                found: 1,
                start: 8000,
                end: 8004
            }
        );
    }

    #[test]
    fn test_range_end_is_exclusive() {
        let probe = FakeProbe::new([]);

        let err = allocate(&probe, 8000, 8002, 3, &BTreeSet::new()).unwrap_err();
        assert_eq!(err.found, 2);
        assert!(!probe.probed.borrow().contains(&8002));

        let ports = allocate(&probe, 8000, 8003, 3, &BTreeSet::new()).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002]);
    }

    #[test]
    fn test_zero_count() {
        let probe = FakeProbe::new([]);
        assert!(allocate(&probe, 8000, 8010, 0, &BTreeSet::new()).unwrap().is_empty());
        assert!(probe.probed.borrow().is_empty());
    }

    #[test]
    fn test_inverted_range_is_exhausted() {
        let probe = FakeProbe::new([]);
        assert!(allocate(&probe, 9000, 8000, 1, &BTreeSet::new()).is_err());
    }

    #[test]
    fn test_tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(probe.is_listening(port));

        let allocator = PortAllocator::with_probe(port, port.saturating_add(1), probe);
        assert!(allocator.allocate(1, &BTreeSet::new()).is_err());
    }
}
