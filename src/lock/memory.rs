//! In-process lock backend
//!
//! Suitable for a single process (tests, one-shot CLI runs with
//! `lock.backend = "memory"`). Offers no protection across processes.

use crate::error::{StagehouseError, StagehouseResult};
use crate::lock::{HeldLock, LockMode, Locker};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Holders {
    exclusive: bool,
    shared: usize,
}

type LockTable = Arc<Mutex<HashMap<String, Holders>>>;

/// Lock table shared by every handle it issues
#[derive(Debug, Default, Clone)]
pub struct MemoryLocker {
    table: LockTable,
}

impl MemoryLocker {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct MemoryLock {
    name: String,
    mode: LockMode,
    table: LockTable,
    released: bool,
}

impl HeldLock for MemoryLock {
    fn release(&mut self) -> StagehouseResult<()> {
        if self.released {
            return Ok(());
        }

        let mut table = self.table.lock().map_err(|_| StagehouseError::LockRelease {
            lock: self.name.clone(),
            reason: "lock table poisoned".to_string(),
        })?;

        if let Some(holders) = table.get_mut(&self.name) {
            match self.mode {
                LockMode::Exclusive => holders.exclusive = false,
                LockMode::Shared => holders.shared = holders.shared.saturating_sub(1),
            }
            if !holders.exclusive && holders.shared == 0 {
                table.remove(&self.name);
            }
        }

        self.released = true;
        Ok(())
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn try_acquire(
        &self,
        name: &str,
        mode: LockMode,
    ) -> StagehouseResult<Option<Box<dyn HeldLock>>> {
        let mut table = self.table.lock().map_err(|_| StagehouseError::LockBackend {
            lock: name.to_string(),
            reason: "lock table poisoned".to_string(),
        })?;

        let holders = table.entry(name.to_string()).or_default();
        let granted = match mode {
            LockMode::Exclusive if !holders.exclusive && holders.shared == 0 => {
                holders.exclusive = true;
                true
            }
            LockMode::Shared if !holders.exclusive => {
                holders.shared += 1;
                true
            }
            _ => false,
        };

        if !granted {
            return Ok(None);
        }

        Ok(Some(Box::new(MemoryLock {
            name: name.to_string(),
            mode,
            table: Arc::clone(&self.table),
            released: false,
        })))
    }

    fn locker_name(&self) -> &'static str {
        "memory"
    }
}
