use std::fmt;

use chrono::{DateTime, Utc};

/// Stable identity of a pooled connection: the slot it occupies plus the
/// generation the slot had when the connection moved in.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId {
    slot: u32,
    generation: u64,
}

impl ConnectionId {
    pub fn new(slot: u32, generation: u64) -> Self {
        Self { slot, generation }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    Exhausted { capacity: usize },
    SlotOutOfRange { slot: u32 },
    StaleIdentity { requested: ConnectionId, current: Option<ConnectionId> },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { capacity } => {
                write!(f, "connection pool exhausted (capacity {capacity})")
            }
            Self::SlotOutOfRange { slot } => write!(f, "slot {slot} is outside the pool"),
            Self::StaleIdentity { requested, current } => match current {
                Some(current) => write!(
                    f,
                    "connection {requested} is gone, slot now holds {current}"
                ),
                None => write!(f, "connection {requested} is gone, slot is free"),
            },
        }
    }
}

impl std::error::Error for PoolError {}

/// Failure while building the occupant of a freshly reserved slot.
#[derive(Debug)]
pub enum AcquireError<E> {
    Pool(PoolError),
    Init(E),
}

impl<E: fmt::Display> fmt::Display for AcquireError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(source) => write!(f, "{source}"),
            Self::Init(source) => write!(f, "connection init failed: {source}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AcquireError<E> {}

struct Slot<T> {
    generation: u64,
    occupant: Option<Occupant<T>>,
}

struct Occupant<T> {
    value: T,
    connected_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SlotSnapshot {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

/// Fixed-capacity arena of connection handlers.
///
/// Releasing a slot bumps its generation, so an identity handed out for one
/// occupant never resolves to a later occupant of the same slot.
pub struct ConnectionPool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> ConnectionPool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                occupant: None,
            })
            .collect();
        // Lowest slots are handed out first.
        let free = (0..capacity as u32).rev().collect();

        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves a slot and builds its occupant. When `init` fails the slot is
    /// handed back before the error is returned.
    pub fn acquire_with<E>(
        &mut self,
        init: impl FnOnce(ConnectionId) -> Result<T, E>,
    ) -> Result<ConnectionId, AcquireError<E>> {
        let slot = self.free.pop().ok_or(AcquireError::Pool(PoolError::Exhausted {
            capacity: self.slots.len(),
        }))?;
        let id = ConnectionId::new(slot, self.slots[slot as usize].generation);

        match init(id) {
            Ok(value) => {
                self.slots[slot as usize].occupant = Some(Occupant {
                    value,
                    connected_at: Utc::now(),
                });
                Ok(id)
            }
            Err(error) => {
                self.retire(slot);
                Err(AcquireError::Init(error))
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.occupant.as_ref().map(|occupant| &occupant.value)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.occupant.as_mut().map(|occupant| &mut occupant.value)
    }

    /// Identity of whatever currently lives in `slot`.
    pub fn current_id(&self, slot: u32) -> Option<ConnectionId> {
        let entry = self.slots.get(slot as usize)?;
        entry
            .occupant
            .as_ref()
            .map(|_| ConnectionId::new(slot, entry.generation))
    }

    /// Resolves `id` only while the same occupant is live; otherwise reports
    /// who, if anyone, holds the slot now.
    pub fn resolve_mut(&mut self, id: ConnectionId) -> Result<&mut T, PoolError> {
        let current = self.current_id(id.slot);
        if id.slot as usize >= self.slots.len() {
            return Err(PoolError::SlotOutOfRange { slot: id.slot });
        }
        if current != Some(id) {
            return Err(PoolError::StaleIdentity {
                requested: id,
                current,
            });
        }

        self.slots[id.slot as usize]
            .occupant
            .as_mut()
            .map(|occupant| &mut occupant.value)
            .ok_or(PoolError::StaleIdentity {
                requested: id,
                current: None,
            })
    }

    /// Removes the occupant and retires its identity.
    pub fn release(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let occupant = slot.occupant.take()?;
        self.retire(id.slot);
        Some(occupant.value)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot().into_iter().map(|entry| entry.id).collect()
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.occupant.as_ref().map(|occupant| SlotSnapshot {
                    id: ConnectionId::new(index as u32, slot.generation),
                    connected_at: occupant.connected_at,
                })
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(ConnectionId, T)> {
        let ids = self.ids();
        ids.into_iter()
            .filter_map(|id| self.release(id).map(|value| (id, value)))
            .collect()
    }

    fn retire(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::{AcquireError, ConnectionId, ConnectionPool, PoolError};

    fn acquire(pool: &mut ConnectionPool<&'static str>, value: &'static str) -> ConnectionId {
        pool.acquire_with(|_| Ok::<_, ()>(value))
            .expect("slot should be available")
    }

    #[test]
    fn hands_out_lowest_free_slot_first() {
        let mut pool = ConnectionPool::with_capacity(3);

        assert_eq!(acquire(&mut pool, "a"), ConnectionId::new(0, 0));
        assert_eq!(acquire(&mut pool, "b"), ConnectionId::new(1, 0));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn exhaustion_rejects_without_touching_existing_occupants() {
        let mut pool = ConnectionPool::with_capacity(1);
        let first = acquire(&mut pool, "first");

        let err = pool
            .acquire_with(|_| Ok::<_, ()>("second"))
            .expect_err("pool should be exhausted");
        assert!(matches!(
            err,
            AcquireError::Pool(PoolError::Exhausted { capacity: 1 })
        ));
        assert_eq!(pool.get(first), Some(&"first"));
    }

    #[test]
    fn failed_init_returns_slot_to_pool() {
        let mut pool: ConnectionPool<&'static str> = ConnectionPool::with_capacity(1);

        let err = pool
            .acquire_with(|_| Err("socket option failed"))
            .expect_err("init failure should surface");
        assert!(matches!(err, AcquireError::Init("socket option failed")));
        assert_eq!(pool.len(), 0);

        let id = acquire(&mut pool, "retry");
        assert_eq!(id.slot(), 0);
        assert_eq!(id.generation(), 1);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut pool = ConnectionPool::with_capacity(1);
        let old = acquire(&mut pool, "old");
        assert_eq!(pool.release(old), Some("old"));

        let new = acquire(&mut pool, "new");
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(pool.get(old), None);
        assert_eq!(pool.get(new), Some(&"new"));
        assert_eq!(
            pool.resolve_mut(old),
            Err(PoolError::StaleIdentity {
                requested: old,
                current: Some(new)
            })
        );
    }

    #[test]
    fn releasing_stale_identity_is_a_no_op() {
        let mut pool = ConnectionPool::with_capacity(1);
        let old = acquire(&mut pool, "old");
        pool.release(old);
        let new = acquire(&mut pool, "new");

        assert_eq!(pool.release(old), None);
        assert_eq!(pool.get(new), Some(&"new"));
    }

    #[test]
    fn resolve_reports_out_of_range_slots() {
        let mut pool: ConnectionPool<&'static str> = ConnectionPool::with_capacity(2);
        assert_eq!(
            pool.resolve_mut(ConnectionId::new(9, 0)),
            Err(PoolError::SlotOutOfRange { slot: 9 })
        );
        assert_eq!(
            pool.resolve_mut(ConnectionId::new(1, 0)),
            Err(PoolError::StaleIdentity {
                requested: ConnectionId::new(1, 0),
                current: None
            })
        );
    }

    #[test]
    fn drain_empties_every_slot() {
        let mut pool = ConnectionPool::with_capacity(4);
        acquire(&mut pool, "a");
        acquire(&mut pool, "b");

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert!(pool.snapshot().is_empty());
    }
}
