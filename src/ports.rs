//! Port allocation for per-run log receivers.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

/// Hands out ports from `[base, base + count)` in increasing order and never
/// reuses one. Zero leaves the choice to the operating system; it is returned
/// for a base of zero and once the range is used up.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    count: u16,
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base,
            count: count.max(1),
            next: AtomicU32::new(0),
        }
    }

    pub fn next_port(&self) -> u16 {
        if self.base == 0 {
            return 0;
        }
        let n = match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
        {
            Ok(n) | Err(n) => n,
        };
        if n < u32::from(self.count) {
            if let Ok(port) = u16::try_from(u32::from(self.base) + n) {
                return port;
            }
        } else if n == u32::from(self.count) {
            warn!(
                "Log ports {}..{} used up, falling back to ephemeral ports",
                self.base,
                u32::from(self.base) + u32::from(self.count)
            );
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_never_reused() {
        let ports = PortAllocator::new(9000, 3);
        let got: Vec<u16> = (0..5).map(|_| ports.next_port()).collect();
        assert_eq!(got, vec![9000, 9001, 9002, 0, 0]);
    }

    #[test]
    fn test_range_clipped_at_top_of_port_space() {
        let ports = PortAllocator::new(65534, 10);
        let got: Vec<u16> = (0..3).map(|_| ports.next_port()).collect();
        assert_eq!(got, vec![65534, 65535, 0]);
    }

    #[test]
    fn test_ephemeral() {
        let ports = PortAllocator::new(0, 10);
        assert_eq!(ports.next_port(), 0);
        assert_eq!(ports.next_port(), 0);
    }
}
