//! Process-wide record of memory that native code may still reference after a
//! call returns. Every lease has exactly one release point,
//! [`LeaseTable::release`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::trace;

use crate::callback::Callback;

pub enum Lease {
    /// A heap copy owned by the table until released.
    Copy(Box<[u8]>),
    /// A foreign address native code handed out or holds on to.
    Pin,
    /// A callback whose entry point must stay valid.
    Callback(Callback),
}

impl Lease {
    /// A NUL-terminated copy of `bytes`, with the address it lives at.
    pub fn copy(bytes: &[u8]) -> (usize, Lease) {
        let mut block = Vec::with_capacity(bytes.len() + 1);
        block.extend_from_slice(bytes);
        block.push(0);
        let block = block.into_boxed_slice();
        (block.as_ptr() as usize, Lease::Copy(block))
    }

    pub fn pinned(callback: Option<Callback>) -> Lease {
        match callback {
            Some(callback) => Lease::Callback(callback),
            None => Lease::Pin,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Lease::Copy(_) => "copy",
            Lease::Pin => "pin",
            Lease::Callback(_) => "callback",
        }
    }
}

#[derive(Default)]
pub struct LeaseTable {
    leases: Mutex<HashMap<usize, Lease>>,
}

static LEASES: OnceLock<LeaseTable> = OnceLock::new();

pub fn leases() -> &'static LeaseTable {
    LEASES.get_or_init(LeaseTable::default)
}

impl LeaseTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Lease>> {
        match self.leases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copies `bytes` plus a trailing NUL into a leased block and returns its
    /// address.
    pub fn keep(&self, bytes: &[u8]) -> usize {
        let (address, lease) = Lease::copy(bytes);
        self.insert(address, lease);
        address
    }

    pub fn pin(&self, address: usize, callback: Option<Callback>) {
        self.insert(address, Lease::pinned(callback));
    }

    /// Records `lease` under `address`. Null is never leased, and a pin never
    /// replaces a copy the table already owns.
    pub fn insert(&self, address: usize, lease: Lease) {
        if address == 0 {
            return;
        }
        match &lease {
            Lease::Copy(block) => {
                trace!(address = format_args!("0x{address:x}"), size = block.len() - 1, "lease copy");
            }
            _ => trace!(address = format_args!("0x{address:x}"), kind = lease.kind(), "lease pin"),
        }
        let mut leases = self.lock();
        if matches!(lease, Lease::Copy(_)) || !matches!(leases.get(&address), Some(Lease::Copy(_))) {
            leases.insert(address, lease);
        }
    }

    pub fn release(&self, address: usize) -> bool {
        let released = self.lock().remove(&address);
        if let Some(lease) = &released {
            trace!(address = format_args!("0x{address:x}"), kind = lease.kind(), "lease release");
        }
        released.is_some()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.lock().contains_key(&address)
    }

    pub fn held(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_copy_is_terminated_and_released_once() {
        let table = LeaseTable::default();
        let address = table.keep(b"abc");
        let copy = unsafe { std::slice::from_raw_parts(address as *const u8, 4) };
        assert_eq!(copy, b"abc\0");
        assert!(table.contains(address));
        assert!(table.release(address));
        assert!(!table.release(address));
        assert_eq!(table.held(), 0);
    }

    #[test]
    fn null_is_never_pinned() {
        let table = LeaseTable::default();
        table.pin(0, None);
        assert_eq!(table.held(), 0);
        table.pin(0x1000, None);
        assert!(table.contains(0x1000));
    }
}
