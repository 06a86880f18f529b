// utp/ids.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::utp::common::{ConnectionId, Role, UtpError, random_even_id};

/// Number of even identifiers in the 16-bit id space
const EVEN_IDS: u32 = 1 << 15;

/// A connection as the multiplexer sees it: the peer plus the even id `E` of
/// the `{E, E + 1}` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub remote: SocketAddr,
    pub id: ConnectionId,
}

impl ConnKey {
    pub fn new(remote: SocketAddr, id: ConnectionId) -> Self {
        Self { remote, id }
    }
}

/// Identifies one stream of a socket: outbound and inbound maps may hold the
/// same `ConnKey`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub role: Role,
    pub key: ConnKey,
}

impl StreamKey {
    pub fn new(role: Role, key: ConnKey) -> Self {
        Self { role, key }
    }
}

/// Even-numbered cursor probed linearly for the next free outbound id
#[derive(Debug)]
pub struct IdAllocator {
    cursor: ConnectionId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Start from a random even id
    pub fn new() -> Self {
        Self::with_cursor(random_even_id())
    }

    pub fn with_cursor(cursor: ConnectionId) -> Self {
        Self { cursor: cursor & !1 }
    }

    pub fn cursor(&self) -> ConnectionId {
        self.cursor
    }

    /// First even id from the cursor for which `is_taken` is false. The
    /// cursor moves past the id handed out.
    pub fn allocate(
        &mut self,
        remote: SocketAddr,
        is_taken: impl Fn(ConnectionId) -> bool,
    ) -> Result<ConnectionId, UtpError> {
        for step in 0..EVEN_IDS {
            let id = self.cursor.wrapping_add((step * 2) as u16);
            if !is_taken(id) {
                self.cursor = id.wrapping_add(2);
                return Ok(id);
            }
        }
        Err(UtpError::ExhaustedIdentifierSpace(remote))
    }
}

/// Recently freed ids and when they were freed, per direction
#[derive(Debug)]
pub struct IdQuarantine {
    window_micros: u64,
    freed: HashMap<(Role, ConnKey), u64>,
}

impl IdQuarantine {
    pub fn new(window_micros: u64) -> Self {
        Self {
            window_micros,
            freed: HashMap::new(),
        }
    }

    pub fn insert(&mut self, role: Role, key: ConnKey, now: u64) {
        if self.window_micros > 0 {
            self.freed.insert((role, key), now);
        }
    }

    pub fn contains(&self, role: Role, key: &ConnKey, now: u64) -> bool {
        self.freed
            .get(&(role, *key))
            .is_some_and(|freed_at| now.saturating_sub(*freed_at) < self.window_micros)
    }

    /// Forget entries whose window has passed
    pub fn purge(&mut self, now: u64) {
        let window = self.window_micros;
        self.freed
            .retain(|_, freed_at| now.saturating_sub(*freed_at) < window);
    }

    pub fn len(&self) -> usize {
        self.freed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn remote() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 4000))
    }

    #[test]
    fn test_allocate_is_even_and_advances() {
        let mut ids = IdAllocator::with_cursor(101);
        assert_eq!(ids.cursor(), 100);
        assert_eq!(ids.allocate(remote(), |_| false).unwrap(), 100);
        assert_eq!(ids.allocate(remote(), |_| false).unwrap(), 102);
        assert_eq!(ids.cursor(), 104);
    }

    #[test]
    fn test_allocate_skips_taken() {
        let taken: HashSet<ConnectionId> = [10, 12, 14].into_iter().collect();
        let mut ids = IdAllocator::with_cursor(10);
        assert_eq!(ids.allocate(remote(), |id| taken.contains(&id)).unwrap(), 16);
    }

    #[test]
    fn test_allocate_wraps() {
        let mut ids = IdAllocator::with_cursor(65534);
        assert_eq!(ids.allocate(remote(), |_| false).unwrap(), 65534);
        assert_eq!(ids.allocate(remote(), |_| false).unwrap(), 0);
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut ids = IdAllocator::with_cursor(0);
        let result = ids.allocate(remote(), |_| true);
        assert!(matches!(result, Err(UtpError::ExhaustedIdentifierSpace(addr)) if addr == remote()));
        assert_eq!(ids.cursor(), 0);
    }

    #[test]
    fn test_quarantine_window() {
        let mut quarantine = IdQuarantine::new(5_000_000);
        let key = ConnKey::new(remote(), 8);
        quarantine.insert(Role::Initiator, key, 1_000_000);

        assert!(quarantine.contains(Role::Initiator, &key, 1_000_000));
        assert!(quarantine.contains(Role::Initiator, &key, 5_999_999));
        assert!(!quarantine.contains(Role::Acceptor, &key, 2_000_000));
        assert!(!quarantine.contains(Role::Initiator, &key, 6_000_000));

        quarantine.purge(5_000_000);
        assert_eq!(quarantine.len(), 1);
        quarantine.purge(6_000_000);
        assert!(quarantine.is_empty());
    }

    #[test]
    fn test_zero_window_disables_quarantine() {
        let mut quarantine = IdQuarantine::new(0);
        let key = ConnKey::new(remote(), 8);
        quarantine.insert(Role::Acceptor, key, 0);
        assert!(!quarantine.contains(Role::Acceptor, &key, 0));
        assert!(quarantine.is_empty());
    }
}
