//! Generation-counted slot map for registered connections.
//!
//! Slot indices are stable while a connection is registered and are
//! recycled through a free-list afterwards. Every recycle bumps the
//! slot's generation, so a stale `SlotHandle` (or a message tagged with
//! a freed connection's UID) can never be attributed to the slot's next
//! occupant.

use crate::socket::types::{SlotHandle, Uid};
use std::collections::HashMap;

#[derive(Debug)]
enum Slot<T> {
    Vacant { next_free: Option<u32>, generation: u32 },
    Occupied { generation: u32, uid: Uid, entry: T },
}

#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    /// Head of the free-list (LIFO: most recently freed reused first).
    free_head: Option<u32>,
    by_uid: HashMap<Uid, SlotHandle>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            by_uid: HashMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `uid` in the first free slot.
    pub fn register(&mut self, uid: Uid, entry: T) -> SlotHandle {
        let handle = match self.free_head {
            Some(index) => {
                let generation = match &self.slots[index as usize] {
                    Slot::Vacant { next_free, generation } => {
                        self.free_head = *next_free;
                        *generation
                    }
                    Slot::Occupied { .. } => unreachable!("free-list points at occupied slot"),
                };
                self.slots[index as usize] = Slot::Occupied {
                    generation,
                    uid,
                    entry,
                };
                SlotHandle { index, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    uid,
                    entry,
                });
                SlotHandle { index, generation: 0 }
            }
        };
        self.by_uid.insert(uid, handle);
        handle
    }

    /// Frees the slot, bumping its generation. Stale handles return
    /// `None` and leave the registry untouched.
    pub fn deregister(&mut self, handle: SlotHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, uid, .. } if *generation == handle.generation => {
                self.by_uid.remove(uid);
                let next_gen = generation.wrapping_add(1);
                let old = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_gen,
                    },
                );
                self.free_head = Some(handle.index);
                match old {
                    Slot::Occupied { entry, .. } => Some(entry),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, entry, .. } if *generation == handle.generation => {
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, entry, .. } if *generation == handle.generation => {
                Some(entry)
            }
            _ => None,
        }
    }

    /// UID occupying `handle`, if the handle is live.
    pub fn uid_at(&self, handle: SlotHandle) -> Option<Uid> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, uid, .. } if *generation == handle.generation => {
                Some(*uid)
            }
            _ => None,
        }
    }

    pub fn handle_of(&self, uid: Uid) -> Option<SlotHandle> {
        self.by_uid.get(&uid).copied()
    }

    pub fn get_by_uid(&self, uid: Uid) -> Option<&T> {
        self.get(self.handle_of(uid)?)
    }

    pub fn get_by_uid_mut(&mut self, uid: Uid) -> Option<&mut T> {
        let handle = self.handle_of(uid)?;
        self.get_mut(handle)
    }

    /// Exchanges the entries (and thus the UIDs' slots) of two live
    /// connections. Each UID keeps its entry; the slot handles swap
    /// owners. Returns `false` if either UID is unknown.
    pub fn swap_slots(&mut self, a: Uid, b: Uid) -> bool {
        let (ha, hb) = match (self.handle_of(a), self.handle_of(b)) {
            (Some(ha), Some(hb)) => (ha, hb),
            _ => return false,
        };
        if ha == hb {
            return true;
        }
        let (ia, ib) = (ha.index as usize, hb.index as usize);
        // Split borrows to swap the two occupied slots' payloads.
        let (lo, hi) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let (left, right) = self.slots.split_at_mut(hi);
        match (&mut left[lo], &mut right[0]) {
            (
                Slot::Occupied { uid: u1, entry: e1, .. },
                Slot::Occupied { uid: u2, entry: e2, .. },
            ) => {
                std::mem::swap(u1, u2);
                std::mem::swap(e1, e2);
            }
            _ => return false,
        }
        self.by_uid.insert(a, hb);
        self.by_uid.insert(b, ha);
        true
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotHandle, Uid, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { generation, uid, entry } => Some((
                SlotHandle {
                    index: i as u32,
                    generation: *generation,
                },
                *uid,
                entry,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}
