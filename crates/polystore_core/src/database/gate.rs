//! Serializes writes to one record within this process.
//!
//! Adapters make each write conditional on the state it was diffed
//! against, which keeps stored data and reported changes correct across
//! processes. The gate additionally holds a record's stripe from the
//! read that precedes a write until its audit entry is appended, so
//! in-process audit entries for one record appear in commit order.

use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const STRIPES: usize = 64;

pub(crate) struct WriteGate {
    stripes: Vec<Mutex<()>>,
}

impl WriteGate {
    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Holds the stripe for `tenant`/`model`/`id` until the guard drops.
    /// Never take a second stripe while holding one.
    pub(crate) fn lock(&self, tenant: &str, model: &str, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        (tenant, model, id).hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % STRIPES as u64).unwrap_or(0);
        self.stripes[index].lock()
    }
}
