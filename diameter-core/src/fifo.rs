// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ordered blocking queue connecting the pipeline stages.
//!
//! Every stage of the daemon (receiver threads, the peer state machine, the
//! out-senders) communicates through these queues. A queue can carry any
//! owned item type; dequeuing transfers ownership to the consumer.
//!
//! Two features go beyond a plain channel:
//!
//! - threshold callbacks: a high/low watermark pair whose callbacks fire in
//!   strict alternation as the queue level crosses them, used for
//!   back-pressure accounting by the consumers;
//! - redirection: an existing queue can be moved into another one, after
//!   which its backlog and all future posts land in the target. The
//!   connection layer uses this to swap a connection's private event queue
//!   for the peer's queue without losing events.

use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::Instant,
};


/// The queue was closed. Consumers treat this as fatal for the pipeline
/// stage the queue belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Closed;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GetError {
    #[error("queue is empty")]
    WouldBlock,
    #[error("deadline elapsed")]
    Timeout,
    #[error("queue is closed")]
    Closed,
}

impl From<Closed> for GetError {
    fn from(_: Closed) -> Self {
        GetError::Closed
    }
}

/// Token installed by a high-threshold callback and cleared by the matching
/// low-threshold callback.
pub type Token = Box<dyn Any + Send>;

pub type ThresholdCb = Box<dyn FnMut(&mut Option<Token>) + Send>;

struct Thresholds {
    high: usize,
    low: usize,
    high_cb: Option<ThresholdCb>,
    low_cb: Option<ThresholdCb>,
    token: Option<Token>,
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// When set, this queue has been moved: its backlog was drained into the
    /// target and every future operation forwards there.
    redirect: Option<Fifo<T>>,
    /// Soft limit; posts block while the queue is at the limit.
    limit: Option<usize>,
    /// The high threshold fired and the matching low one has not yet.
    armed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    readable: Condvar,
    writable: Condvar,
    thresholds: Mutex<Option<Thresholds>>,
    /// Serializes callback invocations so the token handoff from a high
    /// callback to its matching low callback is never interleaved.
    cb_run: Mutex<()>,
}

pub struct Fifo<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Fifo<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Fifo<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Fifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Fifo")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .field("moved", &state.redirect.is_some())
            .finish()
    }
}

impl<T> Fifo<T> {
    #[inline]
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(limit: Option<usize>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            closed: false,
            redirect: None,
            limit,
            armed: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                readable: Condvar::new(),
                writable: Condvar::new(),
                thresholds: Mutex::new(None),
                cb_run: Mutex::new(()),
            }),
        }
    }

    /// Append an item. Blocks while the queue sits at its soft limit.
    pub fn post(&self, item: T) -> Result<(), Closed> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(Closed);
            }
            if let Some(redirect) = state.redirect.clone() {
                drop(state);
                return redirect.post(item);
            }
            match state.limit {
                Some(limit) if state.queue.len() >= limit => {
                    self.shared.writable.wait(&mut state);
                }
                _ => break,
            }
        }
        state.queue.push_back(item);
        let fire = self.cross_high(&mut state);
        drop(state);
        // a single blocked consumer is woken by exactly one post
        self.shared.readable.notify_one();
        if fire {
            self.fire(true);
        }
        Ok(())
    }

    /// Pop the oldest item, blocking until one is available or the queue is
    /// closed.
    pub fn get(&self) -> Result<T, Closed> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(redirect) = state.redirect.clone() {
                drop(state);
                return redirect.get();
            }
            if let Some(item) = state.queue.pop_front() {
                let fire = self.cross_low(&mut state);
                drop(state);
                self.shared.writable.notify_one();
                if fire {
                    self.fire(false);
                }
                return Ok(item);
            }
            if state.closed {
                return Err(Closed);
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Pop the oldest item without blocking.
    pub fn try_get(&self) -> Result<T, GetError> {
        let mut state = self.shared.state.lock();
        if let Some(redirect) = state.redirect.clone() {
            drop(state);
            return redirect.try_get();
        }
        if let Some(item) = state.queue.pop_front() {
            let fire = self.cross_low(&mut state);
            drop(state);
            self.shared.writable.notify_one();
            if fire {
                self.fire(false);
            }
            return Ok(item);
        }
        if state.closed {
            Err(GetError::Closed)
        } else {
            Err(GetError::WouldBlock)
        }
    }

    /// Pop the oldest item, waiting at most until `deadline`.
    pub fn timed_get(&self, deadline: Instant) -> Result<T, GetError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(redirect) = state.redirect.clone() {
                drop(state);
                return redirect.timed_get(deadline);
            }
            if let Some(item) = state.queue.pop_front() {
                let fire = self.cross_low(&mut state);
                drop(state);
                self.shared.writable.notify_one();
                if fire {
                    self.fire(false);
                }
                return Ok(item);
            }
            if state.closed {
                return Err(GetError::Closed);
            }
            if self
                .shared
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match state.queue.pop_front() {
                    Some(item) => {
                        let fire = self.cross_low(&mut state);
                        drop(state);
                        self.shared.writable.notify_one();
                        if fire {
                            self.fire(false);
                        }
                        Ok(item)
                    }
                    None => Err(GetError::Timeout),
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        match &state.redirect {
            Some(redirect) => redirect.len(),
            None => state.queue.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install the watermark pair. The high callback fires once when the
    /// queue level first reaches `high`; the low callback fires once when it
    /// next falls back to `low`; the two strictly alternate. Callbacks run
    /// on the posting or getting thread without the queue lock held, and
    /// must not post to or drain the queue they are attached to.
    pub fn set_thresholds(
        &self,
        high: usize,
        high_cb: ThresholdCb,
        low: usize,
        low_cb: ThresholdCb,
    ) {
        let mut thresholds = self.shared.thresholds.lock();
        *thresholds = Some(Thresholds {
            high,
            low,
            high_cb: Some(high_cb),
            low_cb: Some(low_cb),
            token: None,
        });
    }

    /// Move this queue into `dst`: the backlog is spliced onto `dst` in
    /// order and every future post or get is forwarded there. Events are
    /// never lost across the move.
    pub fn move_to(&self, dst: &Fifo<T>) -> Result<(), Closed> {
        if Arc::ptr_eq(&self.shared, &dst.shared) {
            return Ok(());
        }
        let mut src = self.shared.state.lock();
        if src.closed {
            return Err(Closed);
        }
        {
            let mut dst_state = dst.shared.state.lock();
            if dst_state.closed {
                return Err(Closed);
            }
            let backlog = src.queue.drain(..);
            dst_state.queue.extend(backlog);
        }
        src.redirect = Some(dst.clone());
        drop(src);
        dst.shared.readable.notify_all();
        // wake blocked getters so they chase the redirect
        self.shared.readable.notify_all();
        Ok(())
    }

    /// Close the queue. Pending items can still be drained; once empty,
    /// getters receive the `Closed` sentinel. Posters fail immediately.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn cross_high(&self, state: &mut State<T>) -> bool {
        if state.armed {
            return false;
        }
        let thresholds = self.shared.thresholds.lock();
        match thresholds.as_ref() {
            Some(t) if t.high > 0 && state.queue.len() >= t.high => {
                state.armed = true;
                true
            }
            _ => false,
        }
    }

    fn cross_low(&self, state: &mut State<T>) -> bool {
        if !state.armed {
            return false;
        }
        let thresholds = self.shared.thresholds.lock();
        match thresholds.as_ref() {
            Some(t) if state.queue.len() <= t.low => {
                state.armed = false;
                true
            }
            _ => false,
        }
    }

    fn fire(&self, high: bool) {
        let _serialized = self.shared.cb_run.lock();
        let (cb, mut token) = {
            let mut thresholds = self.shared.thresholds.lock();
            match thresholds.as_mut() {
                Some(t) => {
                    let cb = if high { t.high_cb.take() } else { t.low_cb.take() };
                    (cb, t.token.take())
                }
                None => return,
            }
        };
        let Some(mut cb) = cb else { return };
        cb(&mut token);
        let mut thresholds = self.shared.thresholds.lock();
        if let Some(t) = thresholds.as_mut() {
            let slot = if high { &mut t.high_cb } else { &mut t.low_cb };
            if slot.is_none() {
                *slot = Some(cb);
            }
            t.token = token;
        }
    }
}
