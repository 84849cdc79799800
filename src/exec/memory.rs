//! Shared cells under the simulated memory model.
//!
//! A `CRef` cell keeps three pieces of state: a per-thread view map (store
//! forwarding for the thread's own uncommitted writes), a monotonic tick
//! counter bumped by every authoritative write (which is what a CAS ticket
//! is compared against), and the authoritative value itself.
//!
//! Under `SequentialConsistency` every write is authoritative immediately.
//! Under the relaxed models a write lands in a per-key queue of the
//! [`Memory`]'s write buffer (keyed per thread for total store order, per
//! (thread, cell) for partial store order) and only a commit step or a
//! write barrier makes it authoritative. The run loop turns every pending
//! queue head into a commit pseudo-thread, so the scheduler decides when
//! buffered writes settle.

use crate::action::Value;
use crate::types::{CRefId, Failure, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// The simulated memory model for `CRef` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryModel {
    /// Every write is immediately visible to every thread.
    #[default]
    SequentialConsistency,
    /// Writes are buffered per thread and commit in program order.
    TotalStoreOrder,
    /// Writes are buffered per (thread, cell); writes to different cells
    /// by one thread may commit out of order.
    PartialStoreOrder,
}

/// A write-buffer key: the unit whose queued writes commit in order.
pub type BufferKey = (ThreadId, Option<CRefId>);

/// Proof of a `CRef` read used by compare-and-swap.
///
/// The swap succeeds iff the cell's tick still equals the ticket's tick at
/// the moment of the swap.
#[derive(Clone)]
pub struct Ticket {
    pub(crate) tid: ThreadId,
    pub(crate) tick: u64,
    pub(crate) value: Value,
}

impl Ticket {
    /// The value observed when the ticket was taken.
    #[must_use]
    pub fn value(&self) -> Value {
        Value::clone(&self.value)
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ticket({}, tick {})", self.tid, self.tick)
    }
}

#[derive(Debug)]
struct CRefState {
    local: BTreeMap<ThreadId, Value>,
    tick: u64,
    value: Value,
}

impl CRefState {
    fn new(value: Value) -> Self {
        Self {
            local: BTreeMap::new(),
            tick: 0,
            value,
        }
    }

    fn view(&self, tid: ThreadId) -> Value {
        self.local
            .get(&tid)
            .map_or_else(|| Value::clone(&self.value), Value::clone)
    }

    fn write_immediate(&mut self, value: Value) {
        self.tick += 1;
        self.value = value;
    }
}

/// All `CRef` state of one execution: cells plus the write buffer.
pub(crate) struct Memory {
    model: MemoryModel,
    crefs: BTreeMap<CRefId, CRefState>,
    buffer: BTreeMap<BufferKey, VecDeque<(CRefId, Value)>>,
}

impl Memory {
    pub(crate) fn new(model: MemoryModel) -> Self {
        Self {
            model,
            crefs: BTreeMap::new(),
            buffer: BTreeMap::new(),
        }
    }

    pub(crate) const fn model(&self) -> MemoryModel {
        self.model
    }

    pub(crate) fn alloc(&mut self, id: CRefId, value: Value) {
        self.crefs.insert(id, CRefState::new(value));
    }

    fn cell(&self, id: CRefId) -> Result<&CRefState, Failure> {
        self.crefs.get(&id).ok_or(Failure::InternalError)
    }

    fn cell_mut(&mut self, id: CRefId) -> Result<&mut CRefState, Failure> {
        self.crefs.get_mut(&id).ok_or(Failure::InternalError)
    }

    fn buffer_key(&self, tid: ThreadId, cref: CRefId) -> BufferKey {
        match self.model {
            MemoryModel::PartialStoreOrder => (tid, Some(cref)),
            _ => (tid, None),
        }
    }

    /// Reads the cell through the thread's view.
    pub(crate) fn read(&self, tid: ThreadId, cref: CRefId) -> Result<Value, Failure> {
        Ok(self.cell(cref)?.view(tid))
    }

    /// Takes a CAS ticket for the cell through the thread's view.
    pub(crate) fn ticket(&self, tid: ThreadId, cref: CRefId) -> Result<Ticket, Failure> {
        let cell = self.cell(cref)?;
        Ok(Ticket {
            tid,
            tick: cell.tick,
            value: cell.view(tid),
        })
    }

    /// Writes the cell: immediately under sequential consistency, buffered
    /// otherwise.
    pub(crate) fn write(&mut self, tid: ThreadId, cref: CRefId, value: Value) -> Result<(), Failure> {
        if self.model == MemoryModel::SequentialConsistency {
            self.cell_mut(cref)?.write_immediate(value);
            return Ok(());
        }
        let key = self.buffer_key(tid, cref);
        self.cell_mut(cref)?
            .local
            .insert(tid, Value::clone(&value));
        self.buffer.entry(key).or_default().push_back((cref, value));
        Ok(())
    }

    /// Writes the cell authoritatively, bypassing the buffer. The caller
    /// must have flushed the thread's buffer first.
    pub(crate) fn write_immediate(&mut self, cref: CRefId, value: Value) -> Result<(), Failure> {
        self.cell_mut(cref)?.write_immediate(value);
        Ok(())
    }

    /// Attempts a compare-and-swap. Returns the success flag and a fresh
    /// ticket reflecting the cell after the attempt.
    pub(crate) fn cas(
        &mut self,
        tid: ThreadId,
        cref: CRefId,
        ticket: &Ticket,
        value: Value,
    ) -> Result<(bool, Ticket), Failure> {
        let cell = self.cell_mut(cref)?;
        let success = cell.tick == ticket.tick;
        if success {
            cell.write_immediate(value);
        }
        let after = Ticket {
            tid,
            tick: cell.tick,
            value: Value::clone(&cell.value),
        };
        Ok((success, after))
    }

    /// Commits the head write of the queue at `key`, returning the cell it
    /// settled into.
    pub(crate) fn commit(&mut self, key: BufferKey) -> Result<CRefId, Failure> {
        let queue = self.buffer.get_mut(&key).ok_or(Failure::InternalError)?;
        let (cref, value) = queue.pop_front().ok_or(Failure::InternalError)?;
        if queue.is_empty() {
            self.buffer.remove(&key);
        }
        self.cell_mut(cref)?.write_immediate(value);
        // Drop the writer's forwarded view once no later write of that
        // thread to the same cell is still pending.
        let writer = key.0;
        let still_pending = self
            .buffer
            .range((writer, None)..=(writer, Some(CRefId(u64::MAX))))
            .any(|(_, q)| q.iter().any(|(c, _)| *c == cref));
        if !still_pending {
            self.cell_mut(cref)?.local.remove(&writer);
        }
        Ok(cref)
    }

    /// Commits every buffered write of the thread, in enqueued order.
    pub(crate) fn barrier(&mut self, tid: ThreadId) -> Result<(), Failure> {
        let keys: Vec<BufferKey> = self
            .buffer
            .range((tid, None)..=(tid, Some(CRefId(u64::MAX))))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            while self.buffer.contains_key(&key) {
                self.commit(key)?;
            }
        }
        Ok(())
    }

    /// Every buffer key with pending writes, with the cell its head write
    /// targets. One commit pseudo-thread exists per entry.
    pub(crate) fn pending(&self) -> Vec<(BufferKey, CRefId)> {
        self.buffer
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|(cref, _)| (*key, *cref)))
            .collect()
    }

    /// True if no write is buffered for the thread.
    pub(crate) fn buffer_empty_for(&self, tid: ThreadId) -> bool {
        self.buffer
            .range((tid, None)..=(tid, Some(CRefId(u64::MAX))))
            .all(|(_, q)| q.is_empty())
    }

    /// True if no write is buffered at all.
    pub(crate) fn buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("model", &self.model)
            .field("cells", &self.crefs.len())
            .field("buffered_keys", &self.buffer.len())
            .finish()
    }
}
