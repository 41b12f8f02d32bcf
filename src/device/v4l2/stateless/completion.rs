// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Matching of device completions with in-flight pictures.
//!
//! The device completes requests in any order, but pictures are output in the order they are
//! asked for. Waiting for a given picture dequeues completions until that picture shows up; the
//! other pictures completed on the way are marked as done so that asking for them later does not
//! touch the device.
//!
//! Waiting is bounded by a timeout and can be interrupted at any time by a flush, which is
//! signalled through an eventfd polled alongside the device.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::backend::v4l2::decoder::stateless::V4l2Picture;
use crate::decoder::stateless::DecodePhase;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::device::v4l2::stateless::device::StatelessDevice;

const DEVICE_TOKEN: u64 = 1;
const FLUSH_TOKEN: u64 = 2;

/// Signal used to wake up a reconciler waiting for the device. Can be shared across threads.
pub struct FlushSignal(EventFd);

impl FlushSignal {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self(EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)?))
    }

    /// Wakes up any waiter until [`FlushSignal::clear`] is called.
    pub fn raise(&self) -> anyhow::Result<()> {
        self.0.write(1)?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        match self.0.read() {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct CompletionReconciler<D: StatelessDevice> {
    epoll: Epoll,
    flush_signal: Arc<FlushSignal>,
    timeout: Duration,
    in_flight: BTreeMap<u64, Weak<RefCell<V4l2Picture<D>>>>,
}

impl<D: StatelessDevice> CompletionReconciler<D> {
    pub fn new(
        device: &D,
        flush_signal: Arc<FlushSignal>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(device.poll_fd(), EpollEvent::new(EpollFlags::EPOLLIN, DEVICE_TOKEN))?;
        epoll.add(flush_signal.0.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, FLUSH_TOKEN))?;

        Ok(Self { epoll, flush_signal, timeout, in_flight: BTreeMap::new() })
    }

    pub fn flush_signal(&self) -> &Arc<FlushSignal> {
        &self.flush_signal
    }

    /// Starts tracking a queued picture.
    pub fn register(&mut self, id: u64, picture: &Rc<RefCell<V4l2Picture<D>>>) {
        self.in_flight.insert(id, Rc::downgrade(picture));
    }

    /// Forgets all in-flight pictures. Used after a device reset.
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Blocks until the device reports a completion.
    fn poll(&self) -> StatelessBackendResult<()> {
        let timeout_ms = u16::try_from(self.timeout.as_millis()).unwrap_or(u16::MAX);
        let mut events = [EpollEvent::empty(); 2];

        let nb_events = loop {
            match self.epoll.wait(&mut events, EpollTimeout::from(timeout_ms)) {
                Err(Errno::EINTR) => continue,
                res => break res,
            }
        }
        .map_err(|e| StatelessBackendError::fatal(DecodePhase::Polling, e))?;

        if nb_events == 0 {
            return Err(StatelessBackendError::fatal(
                DecodePhase::Polling,
                anyhow!("no completion after {:?}", self.timeout),
            ));
        }

        if events[..nb_events].iter().any(|e| e.data() == FLUSH_TOKEN) {
            debug!("completion wait interrupted by flush");
            return Err(StatelessBackendError::Flushing);
        }

        Ok(())
    }

    /// Marks the in-flight picture `id` as done, if it is still around.
    fn mark_done(&mut self, id: u64) -> StatelessBackendResult<()> {
        let Some(picture) = self.in_flight.remove(&id) else {
            warn!("completion of unknown picture {}", id);
            return Ok(());
        };
        let Some(picture) = picture.upgrade() else {
            debug!("picture {} completed after being dropped", id);
            return Ok(());
        };

        let res = match picture.try_borrow_mut() {
            Ok(mut picture) => picture.mark_done(),
            Err(_) => {
                Err(StatelessBackendError::InvalidState("picture borrowed during completion"))
            }
        };
        res
    }

    /// Dequeues all the completions available without blocking, marking the corresponding
    /// pictures as done. Returns the number of completions processed.
    pub fn reclaim(&mut self, device: &mut D) -> StatelessBackendResult<usize> {
        let mut count = 0;
        while let Some(id) = self.dequeue(device)? {
            self.mark_done(id)?;
            count += 1;
        }

        Ok(count)
    }

    fn dequeue(&self, device: &mut D) -> StatelessBackendResult<Option<u64>> {
        device.dequeue().map_err(|e| StatelessBackendError::fatal(DecodePhase::Polling, e))
    }

    /// Waits until picture `id` has completed.
    ///
    /// Other pictures completing in the meantime are marked as done. The caller is responsible
    /// for marking `id` itself, and must not hold a borrow on any in-flight picture.
    pub fn wait_for(&mut self, device: &mut D, id: u64) -> StatelessBackendResult<()> {
        if !self.in_flight.contains_key(&id) {
            return Err(StatelessBackendError::InvalidState("picture is not in flight"));
        }

        loop {
            self.poll()?;

            while let Some(done) = self.dequeue(device)? {
                if done == id {
                    debug!("{:<20} {:?}", "completed", id);
                    self.in_flight.remove(&id);
                    return Ok(());
                }

                debug!("{:<20} {:?} while waiting for {:?}", "completed", done, id);
                self.mark_done(done)?;
            }
        }
    }
}
