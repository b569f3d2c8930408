//! Generation-checked arena of channel registrations.
//!
//! A [`RegistrationId`] stays valid until its entry is removed. A slot reused
//! by a later insert carries a new generation, so a stale id never reaches the
//! new occupant.

use std::fmt;

// ---------------------------------------------------------------------------
// RegistrationId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId {
    // ---
    index: u32,
    generation: u32,
}

// ---

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

enum Slot<T> {
    // ---
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

// ---

pub(crate) struct Registry<T> {
    // ---
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

// ---

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

// ---

impl<T> Registry<T> {
    // ---
    pub fn insert(&mut self, value: T) -> RegistrationId {
        // ---
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => generation.wrapping_add(1),
                Slot::Occupied { generation, .. } => generation.wrapping_add(1),
            };
            *slot = Slot::Occupied { generation, value };
            return RegistrationId { index, generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        RegistrationId {
            index,
            generation: 0,
        }
    }

    // ---

    pub fn remove(&mut self, id: RegistrationId) -> Option<T> {
        // ---
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: id.generation,
            },
        );
        self.free.push(id.index);

        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    // ---

    pub fn get(&self, id: RegistrationId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: RegistrationId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    // ---

    pub fn iter(&self) -> impl Iterator<Item = (RegistrationId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                RegistrationId {
                    index: i as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RegistrationId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    RegistrationId {
                        index: i as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    // ---

    pub fn clear(&mut self) {
        // ---
        let ids: Vec<RegistrationId> = self.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.remove(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
