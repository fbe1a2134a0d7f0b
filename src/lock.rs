use std::collections::HashMap;
use tracing::debug;
use crate::error::StoreError;
use crate::storage::Inode;

/// Opaque identity of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    /// Report a conflicting lock without changing anything.
    Test,
    Lock,
    Unlock,
}

/// A held or requested lock over `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLock {
    pub start: u64,
    pub end: u64,
    pub mode: LockMode,
    pub owner: LockOwner,
}

impl RangeLock {
    /// Builds `[start, start + length)`. A zero length reaches the end of the offset space.
    pub fn new(start: u64, length: u64, mode: LockMode, owner: LockOwner) -> Self {
        let end = if length == 0 {
            u64::MAX
        } else {
            start.saturating_add(length)
        };
        Self { start, end, mode, owner }
    }

    /// Length of the range, 0 when it runs to the end of the offset space.
    pub fn length(&self) -> u64 {
        if self.end == u64::MAX {
            0
        } else {
            self.end - self.start
        }
    }

    pub fn overlaps(&self, other: &RangeLock) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn conflicts_with(&self, other: &RangeLock) -> bool {
        self.owner != other.owner
            && self.overlaps(other)
            && (self.mode == LockMode::ReadWrite || other.mode == LockMode::ReadWrite)
    }
}

/// Objects are identified by namespace id and inode.
pub type LockKey = (u16, Inode);

/// Byte-range lock bookkeeping for every object of a store.
#[derive(Debug, Default)]
pub struct RangeLockTable {
    locks: HashMap<LockKey, Vec<RangeLock>>,
}

impl RangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches one request.
    pub fn apply(&mut self, key: LockKey, op: LockOp, req: &RangeLock) -> Result<Option<RangeLock>, StoreError> {
        match op {
            LockOp::Test => Ok(self.test(key, req)),
            LockOp::Lock => self.lock(key, req).map(|_| None),
            LockOp::Unlock => {
                self.unlock(key, req);
                Ok(None)
            }
        }
    }

    /// First held lock that would block `req`.
    pub fn test(&self, key: LockKey, req: &RangeLock) -> Option<RangeLock> {
        self.locks
            .get(&key)
            .and_then(|held| held.iter().find(|l| l.conflicts_with(req)).copied())
    }

    /// Acquires `req`, replacing whatever the same owner held over that range.
    pub fn lock(&mut self, key: LockKey, req: &RangeLock) -> Result<(), StoreError> {
        if let Some(conflict) = self.test(key, req) {
            debug!(
                "lock conflict on {:?}: [{}, {}) held by {:?}",
                key, conflict.start, conflict.end, conflict.owner
            );
            return Err(StoreError::would_block(format!(
                "range [{}, {}) held by owner {}",
                conflict.start, conflict.end, conflict.owner.0
            )));
        }

        self.unlock(key, req);
        self.locks.entry(key).or_default().push(*req);
        Ok(())
    }

    /// Releases the owner's hold on `req`'s range, splitting partially covered locks.
    pub fn unlock(&mut self, key: LockKey, req: &RangeLock) {
        let Some(held) = self.locks.get_mut(&key) else {
            return;
        };

        let mut kept = Vec::with_capacity(held.len());
        for l in held.drain(..) {
            if l.owner != req.owner || !l.overlaps(req) {
                kept.push(l);
                continue;
            }
            if l.start < req.start {
                kept.push(RangeLock { end: req.start, ..l });
            }
            if l.end > req.end {
                kept.push(RangeLock { start: req.end, ..l });
            }
        }
        *held = kept;

        if held.is_empty() {
            self.locks.remove(&key);
        }
    }

    pub fn held(&self, key: LockKey) -> Vec<RangeLock> {
        self.locks.get(&key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: LockKey = (1, 10);
    const A: LockOwner = LockOwner(1);
    const B: LockOwner = LockOwner(2);

    #[test]
    fn test_lock_conflict_and_release() {
        let mut table = RangeLockTable::new();
        let held = RangeLock::new(0, 100, LockMode::ReadWrite, A);
        table.lock(KEY, &held).unwrap();

        let probe = RangeLock::new(50, 100, LockMode::Read, B);
        let conflict = table.test(KEY, &probe).unwrap();
        assert_eq!(conflict, held);

        let err = table.lock(KEY, &probe).unwrap_err();
        assert_eq!(err.code, libc::EAGAIN);

        table.unlock(KEY, &held);
        assert!(table.test(KEY, &probe).is_none());
        assert!(table.held(KEY).is_empty());
    }

    #[test]
    fn test_shared_read_locks() {
        let mut table = RangeLockTable::new();
        table.lock(KEY, &RangeLock::new(0, 10, LockMode::Read, A)).unwrap();
        table.lock(KEY, &RangeLock::new(5, 10, LockMode::Read, B)).unwrap();
        assert_eq!(table.held(KEY).len(), 2);

        let writer = RangeLock::new(8, 1, LockMode::ReadWrite, LockOwner(3));
        assert!(table.test(KEY, &writer).is_some());
    }

    #[test]
    fn test_same_owner_never_conflicts() {
        let mut table = RangeLockTable::new();
        table.lock(KEY, &RangeLock::new(0, 10, LockMode::Read, A)).unwrap();
        // upgrade in place replaces the read lock
        table.lock(KEY, &RangeLock::new(0, 10, LockMode::ReadWrite, A)).unwrap();

        let held = table.held(KEY);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].mode, LockMode::ReadWrite);
    }

    #[test]
    fn test_unlock_splits_range() {
        let mut table = RangeLockTable::new();
        table.lock(KEY, &RangeLock::new(0, 100, LockMode::ReadWrite, A)).unwrap();
        table.unlock(KEY, &RangeLock::new(40, 20, LockMode::ReadWrite, A));

        let mut held = table.held(KEY);
        held.sort_by_key(|l| l.start);
        assert_eq!(held.len(), 2);
        assert_eq!((held[0].start, held[0].end), (0, 40));
        assert_eq!((held[1].start, held[1].end), (60, 100));

        assert!(table.test(KEY, &RangeLock::new(45, 10, LockMode::ReadWrite, B)).is_none());
        assert!(table.test(KEY, &RangeLock::new(30, 20, LockMode::ReadWrite, B)).is_some());
    }

    #[test]
    fn test_unlock_other_owner_is_noop() {
        let mut table = RangeLockTable::new();
        let held = RangeLock::new(0, 10, LockMode::ReadWrite, A);
        table.lock(KEY, &held).unwrap();
        table.unlock(KEY, &RangeLock::new(0, 10, LockMode::ReadWrite, B));
        assert_eq!(table.held(KEY), vec![held]);
    }

    #[test]
    fn test_zero_length_reaches_end() {
        let lock = RangeLock::new(100, 0, LockMode::ReadWrite, A);
        assert_eq!(lock.end, u64::MAX);
        assert_eq!(lock.length(), 0);

        let mut table = RangeLockTable::new();
        table.lock(KEY, &lock).unwrap();
        assert!(table.test(KEY, &RangeLock::new(u64::MAX - 10, 5, LockMode::Read, B)).is_some());
        assert!(table.test(KEY, &RangeLock::new(0, 100, LockMode::Read, B)).is_none());
    }
}
