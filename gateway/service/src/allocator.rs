// Copyright (c) 2024 The Botho Foundation

//! Derivation index allocation.
//!
//! Two sessions sharing an index would share a private key, so the counter
//! is advanced inside an `IMMEDIATE` transaction: SQLite's write lock
//! serializes allocators in this process and in any other process using the
//! same database file. The counter row is the only source of the next
//! index; [`SessionStore::migrate`] seeds it from existing sessions.

use bth_gateway_core::{config::MAX_NON_HARDENED_INDEX, Cryptocurrency, GatewayConfig};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{GatewayError, StoreError};
use crate::store::SessionStore;

/// Hands out fresh derivation indices per coin.
#[derive(Clone)]
pub struct AddressAllocator {
    store: SessionStore,
    max_index: BTreeMap<Cryptocurrency, u64>,
}

impl AddressAllocator {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            max_index: BTreeMap::new(),
        }
    }

    /// Allocator using each coin's configured `max_index`.
    pub fn from_config(store: SessionStore, config: &GatewayConfig) -> Self {
        let mut allocator = Self::new(store);
        for (coin, coin_config) in &config.coins {
            allocator.max_index.insert(*coin, coin_config.max_index);
        }
        allocator
    }

    /// Cap the index range of a coin.
    pub fn with_max_index(mut self, coin: Cryptocurrency, max_index: u64) -> Self {
        self.max_index.insert(coin, max_index);
        self
    }

    pub fn max_index(&self, coin: Cryptocurrency) -> u64 {
        self.max_index
            .get(&coin)
            .copied()
            .unwrap_or(MAX_NON_HARDENED_INDEX)
    }

    /// Reserve the next unused index for `coin`.
    ///
    /// Never wraps: once the counter passes the maximum every call fails
    /// with `AllocationExhausted`.
    pub fn allocate(&self, coin: Cryptocurrency) -> Result<u64, GatewayError> {
        let max_index = self.max_index(coin);

        let mut conn = self.store.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let counter: Option<i64> = tx
            .query_row(
                "SELECT next_index FROM address_counters WHERE cryptocurrency = ?1",
                params![coin.code()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;

        let index = counter.unwrap_or(0) as u64;

        if index > max_index {
            return Err(GatewayError::AllocationExhausted { coin, max_index });
        }

        tx.execute(
            r#"
            INSERT INTO address_counters (cryptocurrency, next_index) VALUES (?1, ?2)
            ON CONFLICT(cryptocurrency) DO UPDATE SET next_index = excluded.next_index
            "#,
            params![coin.code(), (index + 1) as i64],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;

        debug!("Allocated {} index {}", coin, index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_gateway_core::session::Session;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn test_store() -> SessionStore {
        let store = SessionStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    #[test]
    fn test_sequential_allocation() {
        let allocator = AddressAllocator::new(test_store());
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 0);
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 1);
        // Counters are per coin
        assert_eq!(allocator.allocate(Cryptocurrency::Bnb).unwrap(), 0);
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 2);
    }

    #[test]
    fn test_exhaustion_never_wraps() {
        let allocator = AddressAllocator::new(test_store()).with_max_index(Cryptocurrency::Matic, 1);
        assert_eq!(allocator.allocate(Cryptocurrency::Matic).unwrap(), 0);
        assert_eq!(allocator.allocate(Cryptocurrency::Matic).unwrap(), 1);
        for _ in 0..3 {
            assert!(matches!(
                allocator.allocate(Cryptocurrency::Matic),
                Err(GatewayError::AllocationExhausted { max_index: 1, .. })
            ));
        }
    }

    #[test]
    fn test_migrate_seeds_counter_from_sessions() {
        let store = test_store();
        let session = Session::new(
            Cryptocurrency::Eth,
            41,
            "0x1111111111111111111111111111111111111111".to_string(),
            "0x2222222222222222222222222222222222222222".to_string(),
            1,
        );
        store.create(&session).unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute("DELETE FROM address_counters", []).unwrap();
        }

        // Restart: migration seeds the counter past index 41
        store.migrate().unwrap();
        let allocator = AddressAllocator::new(store.clone());
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 42);
        assert_eq!(allocator.allocate(Cryptocurrency::Bnb).unwrap(), 0);

        // A later migration never moves the counter backwards
        store.migrate().unwrap();
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 43);
    }

    #[test]
    fn test_concurrent_allocation_is_distinct() {
        let allocator = Arc::new(AddressAllocator::new(test_store()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate(Cryptocurrency::Eth).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "index {} allocated twice", index);
            }
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(seen.iter().max(), Some(&199));
    }

    #[test]
    fn test_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");

        {
            let store = SessionStore::open(&path).unwrap();
            store.migrate().unwrap();
            let allocator = AddressAllocator::new(store);
            allocator.allocate(Cryptocurrency::Eth).unwrap();
            allocator.allocate(Cryptocurrency::Eth).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        store.migrate().unwrap();
        let allocator = AddressAllocator::new(store);
        assert_eq!(allocator.allocate(Cryptocurrency::Eth).unwrap(), 2);
    }
}
