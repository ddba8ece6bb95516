//! A capped free-list for reusable scratch objects.

use std::sync::Mutex;

use crate::item::Item;

/// An object that can be recycled through a [`Pool`].
pub trait Poolable: Default + Send {
    /// Returns the object to its pristine state before it re-enters the
    /// free list. Must not panic.
    fn reset(&mut self);
}

impl Poolable for Vec<Item> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Poolable for String {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Mutex-guarded free list with a capacity cap. Acquire pops a recycled
/// object or builds a fresh one; release resets the object and keeps it
/// only while the list is under the cap, dropping it otherwise.
#[derive(Debug)]
pub struct Pool<T: Poolable> {
    free: Mutex<Vec<T>>,
    cap: usize,
}

impl<T: Poolable> Pool<T> {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Pool {
            free: Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn acquire(&self) -> T {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn release(&self, mut obj: T) {
        obj.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.cap {
            free.push(obj);
        }
        // above cap: obj drops here
    }

    /// Number of objects currently parked in the free list.
    #[must_use]
    pub fn held(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_released() {
        let pool: Pool<Vec<Item>> = Pool::new(4);
        let mut v = pool.acquire();
        v.push(Item::Int(1));
        pool.release(v);
        assert_eq!(pool.held(), 1);
        let v2 = pool.acquire();
        // recycled buffer comes back empty
        assert!(v2.is_empty());
        assert_eq!(pool.held(), 0);
    }

    #[test]
    fn test_cap_drops_excess() {
        let pool: Pool<String> = Pool::new(2);
        pool.release(String::from("a"));
        pool.release(String::from("b"));
        pool.release(String::from("c"));
        assert_eq!(pool.held(), 2);
    }
}
