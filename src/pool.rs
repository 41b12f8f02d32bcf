// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-size pools of buffers shared with the accelerator.
//!
//! A pool is attached with a given number of buffers and hands them out as [`PooledBuffer`]s,
//! which go back to the pool when dropped. Re-attaching the pool bumps its generation so that
//! buffers handed out before the change are discarded instead of returned.
//!
//! Pools can be put into flushing mode, in which every acquisition, including those currently
//! blocked waiting for a free buffer, returns [`PoolError::Flushing`] immediately.

use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use log::debug;
use log::warn;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is flushing")]
    Flushing,
    #[error("no free buffer in pool")]
    Exhausted,
    #[error("pool is not attached")]
    NotAttached,
}

struct PoolState<T> {
    free: VecDeque<T>,
    /// Incremented on every attach and detach.
    generation: u64,
    num_managed: usize,
    flushing: bool,
    attached: bool,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // The state is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A buffer borrowed from a [`BufferPool`]. Goes back to the pool when dropped, unless the pool
/// has been re-attached or destroyed in the meantime.
pub struct PooledBuffer<T> {
    inner: Option<T>,
    pool: Weak<PoolInner<T>>,
    generation: u64,
}

impl<T> PooledBuffer<T> {
    /// Generation of the pool this buffer has been acquired from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Deref for PooledBuffer<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `inner` is only taken in `drop`.
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!(),
        }
    }
}

impl<T> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some(inner) => inner,
            None => unreachable!(),
        }
    }
}

impl<T> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        let (Some(pool), Some(buffer)) = (self.pool.upgrade(), self.inner.take()) else {
            return;
        };

        let mut state = pool.lock();
        if state.attached && state.generation == self.generation {
            state.free.push_back(buffer);
            drop(state);
            pool.available.notify_one();
        } else {
            debug!("dropping buffer of stale pool generation {}", self.generation);
        }
    }
}

/// Snapshot of the occupancy of a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub num_managed: usize,
    pub num_free: usize,
    pub generation: u64,
}

/// A pool of buffers of type `T`. Cloning the pool gives another handle to the same buffers.
pub struct BufferPool<T> {
    name: &'static str,
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, inner: Arc::clone(&self.inner) }
    }
}

impl<T> BufferPool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: VecDeque::new(),
                    generation: 0,
                    num_managed: 0,
                    flushing: false,
                    attached: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Allocates `count` buffers using `alloc` and makes them available for acquisition.
    ///
    /// Any previously attached buffer is released, and buffers currently handed out will not come
    /// back to the pool.
    pub fn attach<F>(&self, count: usize, mut alloc: F) -> anyhow::Result<()>
    where
        F: FnMut(usize) -> anyhow::Result<T>,
    {
        let buffers = (0..count).map(&mut alloc).collect::<anyhow::Result<VecDeque<_>>>()?;

        let mut state = self.inner.lock();
        state.generation += 1;
        state.free = buffers;
        state.num_managed = count;
        state.attached = true;
        debug!(
            "{} pool: attached {} buffers (generation {})",
            self.name, count, state.generation
        );
        drop(state);

        self.inner.available.notify_all();

        Ok(())
    }

    /// Releases all the buffers of the pool. Blocked acquirers return [`PoolError::NotAttached`].
    pub fn detach(&self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.free.clear();
        state.num_managed = 0;
        state.attached = false;
        debug!("{} pool: detached", self.name);
        drop(state);

        self.inner.available.notify_all();
    }

    fn wrap(&self, buffer: T, generation: u64) -> PooledBuffer<T> {
        PooledBuffer { inner: Some(buffer), pool: Arc::downgrade(&self.inner), generation }
    }

    /// Takes a buffer from the pool, waiting for one to be returned if none is free.
    pub fn acquire(&self) -> Result<PooledBuffer<T>, PoolError> {
        let mut state = self.inner.lock();

        loop {
            if state.flushing {
                return Err(PoolError::Flushing);
            }
            if !state.attached {
                return Err(PoolError::NotAttached);
            }
            if let Some(buffer) = state.free.pop_front() {
                let generation = state.generation;
                return Ok(self.wrap(buffer, generation));
            }

            debug!("{} pool: waiting for a free buffer", self.name);
            state = self
                .inner
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes a buffer from the pool if one is free.
    pub fn try_acquire(&self) -> Result<PooledBuffer<T>, PoolError> {
        let mut state = self.inner.lock();

        if state.flushing {
            return Err(PoolError::Flushing);
        }
        if !state.attached {
            return Err(PoolError::NotAttached);
        }

        match state.free.pop_front() {
            Some(buffer) => {
                let generation = state.generation;
                Ok(self.wrap(buffer, generation))
            }
            None => {
                warn!("{} pool exhausted ({} buffers)", self.name, state.num_managed);
                Err(PoolError::Exhausted)
            }
        }
    }

    /// Enters or leaves flushing mode. Entering it wakes up all blocked acquirers.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.lock();
        if state.flushing == flushing {
            return;
        }
        state.flushing = flushing;
        debug!("{} pool: flushing {}", self.name, flushing);
        drop(state);

        if flushing {
            self.inner.available.notify_all();
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.lock().flushing
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    pub fn num_free(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn num_managed(&self) -> usize {
        self.inner.lock().num_managed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            num_managed: state.num_managed,
            num_free: state.free.len(),
            generation: state.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn pool_of(count: usize) -> BufferPool<usize> {
        let pool = BufferPool::new("test");
        pool.attach(count, |i| Ok(i)).unwrap();
        pool
    }

    #[test]
    fn buffers_return_on_drop() {
        let pool = pool_of(2);

        let a = pool.acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!((*a, *b), (0, 1));
        assert_eq!(pool.try_acquire().err(), Some(PoolError::Exhausted));

        drop(a);
        assert_eq!(pool.num_free(), 1);
        assert_eq!(*pool.acquire().unwrap(), 0);
    }

    #[test]
    fn reattach_discards_outstanding_buffers() {
        let pool = pool_of(2);
        let stale = pool.acquire().unwrap();
        assert_eq!(stale.generation(), 1);

        pool.attach(3, |i| Ok(10 + i)).unwrap();
        drop(stale);

        assert_eq!(pool.stats(), PoolStats { num_managed: 3, num_free: 3, generation: 2 });
    }

    #[test]
    fn detached_pool_refuses_acquisition() {
        let pool = BufferPool::<usize>::new("test");
        assert_eq!(pool.acquire().err(), Some(PoolError::NotAttached));

        let pool = pool_of(1);
        pool.detach();
        assert_eq!(pool.try_acquire().err(), Some(PoolError::NotAttached));
    }

    #[test]
    fn flushing_unblocks_waiter() {
        let pool = pool_of(1);
        let _held = pool.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                tx.send(pool.acquire().map(|b| *b)).unwrap();
            })
        };

        // The waiter has nothing to take until the pool flushes.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pool.set_flushing(true);
        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(res, Err(PoolError::Flushing));
        waiter.join().unwrap();

        pool.set_flushing(false);
        assert!(!pool.is_flushing());
    }
}
