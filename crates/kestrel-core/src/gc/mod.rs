//! Mark/sweep collector with generation stamps.
//!
//! The collector owns a slot arena of reference-counted [`HeapObject`]s.
//! Collection is explicit: the caller presents its roots (VM contexts at a
//! safe point, module spaces), the collector bumps its generation counter,
//! stamps every reachable slot with the new generation through a worklist,
//! then sweeps the slots whose stamp is older and unpinned. Host code that
//! holds an item outside any root keeps it alive with a [`GcLock`] pin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::heap::HeapObject;
use crate::item::{Item, ObjRef};
use crate::pool::Pool;

#[derive(Debug)]
struct Slot {
    obj: Option<Arc<HeapObject>>,
    mark: u64,
    pins: u32,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Outcome of one [`Collector::collect`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    /// Live objects before the sweep.
    pub before: usize,
    /// Objects reclaimed by this cycle.
    pub swept: usize,
    /// Live objects after the sweep.
    pub live: usize,
    /// Generation stamped by this cycle.
    pub generation: u64,
}

/// Marking cursor handed to [`GcRoot`]s during a collect cycle.
pub struct Marker<'a> {
    gc: &'a Collector,
    gen: u64,
    work: Vec<Item>,
}

impl Marker<'_> {
    /// Records `item` as reachable. Contained items are traversed when the
    /// worklist drains, so roots never recurse.
    pub fn trace(&mut self, item: Item) {
        if item.obj_ref().is_some() {
            self.work.push(item);
        }
    }

    fn drain(&mut self) {
        while let Some(item) = self.work.pop() {
            let Some(r) = item.obj_ref() else { continue };
            if let Some(obj) = self.gc.stamp(r, self.gen) {
                obj.contained_items(&mut self.work);
            }
        }
    }
}

/// A participant in root enumeration.
pub trait GcRoot {
    fn mark_roots(&self, marker: &mut Marker<'_>);
}

/// The slot arena and its generation counter.
#[derive(Debug)]
pub struct Collector {
    table: Mutex<SlotTable>,
    generation: AtomicU64,
    scratch: Pool<Vec<Item>>,
}

impl Default for Collector {
    fn default() -> Self {
        Collector::new()
    }
}

impl Collector {
    #[must_use]
    pub fn new() -> Self {
        Collector {
            table: Mutex::new(SlotTable::default()),
            generation: AtomicU64::new(1),
            scratch: Pool::new(4),
        }
    }

    /// Allocates a slot for `obj`, stamped with the current generation.
    pub fn store(&self, obj: HeapObject) -> ObjRef {
        let mark = self.generation.load(Ordering::SeqCst);
        let slot = Slot {
            obj: Some(Arc::new(obj)),
            mark,
            pins: 0,
        };
        let mut table = self.table.lock().unwrap();
        if let Some(idx) = table.free.pop() {
            table.slots[idx as usize] = slot;
            ObjRef(idx)
        } else {
            let idx = u32::try_from(table.slots.len()).expect("slot arena exhausted");
            table.slots.push(slot);
            ObjRef(idx)
        }
    }

    /// Allocates `obj` and wraps the handle in an [`Item`] with the right
    /// tag: script object instances become `User`, everything else `Deep`.
    pub fn store_item(&self, obj: HeapObject) -> Item {
        let user = matches!(obj, HeapObject::Object(_));
        let r = self.store(obj);
        if user {
            Item::User(r)
        } else {
            Item::Deep(r)
        }
    }

    /// The payload of a live slot.
    #[must_use]
    pub fn get(&self, r: ObjRef) -> Option<Arc<HeapObject>> {
        let table = self.table.lock().unwrap();
        table.slots.get(r.0 as usize).and_then(|s| s.obj.clone())
    }

    /// Resolves the heap payload behind `item`, if it has one.
    #[must_use]
    pub fn deref(&self, item: &Item) -> Option<Arc<HeapObject>> {
        item.obj_ref().and_then(|r| self.get(r))
    }

    /// Pins `item` (when it is a heap value) so sweeps skip it until the
    /// returned lock drops.
    #[must_use]
    pub fn lock(self: &Arc<Self>, item: Item) -> GcLock {
        if let Some(r) = item.obj_ref() {
            let mut table = self.table.lock().unwrap();
            if let Some(slot) = table.slots.get_mut(r.0 as usize) {
                slot.pins += 1;
            }
        }
        GcLock {
            gc: Arc::clone(self),
            item,
        }
    }

    fn unpin(&self, r: ObjRef) {
        let mut table = self.table.lock().unwrap();
        if let Some(slot) = table.slots.get_mut(r.0 as usize) {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    /// Stamps the slot with `gen`. Returns the payload when this call is
    /// the first to reach the slot this cycle, `None` when it was already
    /// stamped or is empty.
    fn stamp(&self, r: ObjRef, gen: u64) -> Option<Arc<HeapObject>> {
        let mut table = self.table.lock().unwrap();
        let slot = table.slots.get_mut(r.0 as usize)?;
        if slot.obj.is_none() || slot.mark >= gen {
            return None;
        }
        slot.mark = gen;
        slot.obj.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of live slots.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let table = self.table.lock().unwrap();
        table.slots.iter().filter(|s| s.obj.is_some()).count()
    }

    /// Runs one full mark/sweep cycle over the given roots. Pinned slots
    /// are implicit roots. Callers must present every context that may hold
    /// reachable items; contexts mid-step are not safe to enumerate.
    pub fn collect(&self, roots: &[&dyn GcRoot]) -> CollectStats {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let before = self.live_count();

        let mut marker = Marker {
            gc: self,
            gen,
            work: self.scratch.acquire(),
        };
        for root in roots {
            root.mark_roots(&mut marker);
            marker.drain();
        }
        // pinned slots
        let pinned: Vec<Item> = {
            let table = self.table.lock().unwrap();
            table
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.obj.is_some() && s.pins > 0)
                .map(|(i, _)| Item::Deep(ObjRef(i as u32)))
                .collect()
        };
        for item in pinned {
            marker.trace(item);
        }
        marker.drain();
        self.scratch.release(marker.work);

        // Sweep under the table lock, but drop the payloads outside it.
        let mut reaped: Vec<Arc<HeapObject>> = Vec::new();
        {
            let mut table = self.table.lock().unwrap();
            let SlotTable { slots, free } = &mut *table;
            for (idx, slot) in slots.iter_mut().enumerate() {
                if slot.obj.is_some() && slot.pins == 0 && slot.mark < gen {
                    if let Some(obj) = slot.obj.take() {
                        reaped.push(obj);
                        free.push(idx as u32);
                    }
                }
            }
        }
        let swept = reaped.len();
        drop(reaped);

        CollectStats {
            before,
            swept,
            live: before - swept,
            generation: gen,
        }
    }
}

/// Keeps one item alive across collect cycles. Dropping the lock releases
/// the pin; the item is then reclaimed by the next cycle unless some root
/// reaches it.
#[derive(Debug)]
pub struct GcLock {
    gc: Arc<Collector>,
    item: Item,
}

impl GcLock {
    #[must_use]
    pub fn item(&self) -> Item {
        self.item
    }

    /// Explicit release; equivalent to dropping the lock.
    pub fn unlock(self) {}
}

impl Drop for GcLock {
    fn drop(&mut self) {
        if let Some(r) = self.item.obj_ref() {
            self.gc.unpin(r);
        }
    }
}

impl Collector {
    /// Renders `item`, resolving heap payloads up to `depth` levels.
    #[must_use]
    pub fn describe_item(&self, item: &Item, depth: u8) -> String {
        match self.deref(item) {
            Some(obj) => obj.describe(self, depth),
            None => item.to_string(),
        }
    }
}
