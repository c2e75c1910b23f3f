use std::fmt::{Display, Formatter};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::channel::{Abort, TICK};
use crate::error::ChannelError;

/// Resources a single task instance holds while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpus: usize,
    /// Memory in bytes.
    pub memory: u64,
}

impl Resources {
    pub fn new(cpus: usize, memory: u64) -> Self {
        Self { cpus, memory }
    }

    /// Whether `other` can ever be granted out of `self`.
    pub fn covers(&self, other: &Resources) -> bool {
        other.cpus <= self.cpus && other.memory <= self.memory
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self { cpus: 1, memory: 0 }
    }
}

impl Display for Resources {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cpu, {} MB", self.cpus, self.memory / (1 << 20))
    }
}

/// The global resource budget shared by every task instance of a run.
pub(crate) struct Budget {
    total: Resources,
    used: Mutex<Resources>,
    freed: Condvar,
}

impl Budget {
    pub(crate) fn new(total: Resources) -> Self {
        Self {
            total,
            used: Mutex::new(Resources::new(0, 0)),
            freed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Resources> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until `request` fits next to everything already granted.
    ///
    /// Requests larger than the whole budget are rejected at plan time, so
    /// this only ever waits for running instances to finish.
    pub(crate) fn acquire(
        &self,
        request: Resources,
        abort: &Abort,
    ) -> Result<Permit<'_>, ChannelError> {
        let mut used = self.lock();

        loop {
            if abort.is_set() {
                return Err(ChannelError::Aborted);
            }

            let wanted = Resources::new(used.cpus + request.cpus, used.memory + request.memory);
            if self.total.covers(&wanted) {
                *used = wanted;
                return Ok(Permit {
                    budget: self,
                    held: request,
                });
            }

            used = self
                .freed
                .wait_timeout(used, TICK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    #[cfg(test)]
    fn in_use(&self) -> Resources {
        *self.lock()
    }
}

/// A granted share of the budget, returned on drop.
pub(crate) struct Permit<'a> {
    budget: &'a Budget,
    held: Resources,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut used = self.budget.lock();
        used.cpus -= self.held.cpus;
        used.memory -= self.held.memory;
        drop(used);
        self.budget.freed.notify_all();
    }
}
