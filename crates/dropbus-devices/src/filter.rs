/*!
 * Address filter table.
 *
 * Addresses in the table are never given an automatic broadcast proxy.
 * Paired devices land here so their traffic stays with the partner that
 * paired with them.
 */
use tracing::{debug, warn};

use dropbus_core::types::Address;

/// Bounded set of filtered addresses
#[derive(Debug, Clone)]
pub struct AddressFilter {
    entries: Vec<Address>,
    capacity: usize,
}

impl AddressFilter {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Filter `address`
    ///
    /// No-op when `owned` is set, the address is unassigned or already
    /// filtered. A full table drops the request. Returns whether an entry
    /// was added.
    pub fn add(&mut self, address: Address, owned: bool) -> bool {
        if owned || address.is_unassigned() || self.contains(address) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            warn!(%address, capacity = self.capacity, "address filter full, entry dropped");
            return false;
        }
        self.entries.push(address);
        debug!(%address, "address filtered");
        true
    }

    /// Stop filtering `address`; returns whether anything was removed
    pub fn remove(&mut self, address: Address) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| *entry != address);
        let removed = self.entries.len() != before;
        if removed {
            debug!(%address, "address unfiltered");
        }
        removed
    }

    /// Whether `address` is filtered
    pub fn contains(&self, address: Address) -> bool {
        self.entries.contains(&address)
    }

    /// Number of filtered addresses
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Filtered addresses in insertion order
    pub fn addresses(&self) -> &[Address] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refiltering_is_idempotent() {
        let mut filter = AddressFilter::new(4);
        assert!(filter.add(Address::new(7), false));
        assert!(!filter.add(Address::new(7), false));
        assert_eq!(filter.len(), 1);

        assert!(filter.remove(Address::new(7)));
        assert!(!filter.remove(Address::new(7)));
        assert!(filter.is_empty());

        assert!(filter.add(Address::new(7), false));
        assert_eq!(filter.addresses(), &[Address::new(7)]);
    }

    #[test]
    fn test_owned_and_unassigned_are_never_filtered() {
        let mut filter = AddressFilter::new(4);
        assert!(!filter.add(Address::new(3), true));
        assert!(!filter.add(Address::UNASSIGNED, false));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_full_table_drops() {
        let mut filter = AddressFilter::new(2);
        assert!(filter.add(Address::new(1), false));
        assert!(filter.add(Address::new(2), false));
        assert!(!filter.add(Address::new(3), false));
        assert!(!filter.contains(Address::new(3)));
    }
}
