//! Rate-limited persistence with a guaranteed trailing write.
//!
//! ```text
//! submit ─┬─ last write ≥ D ago ──► save now, error returned to caller
//!         └─ otherwise ───────────► keep latest value, arm one timer
//!                                   at last_write + D (if not armed)
//! timer ──────────────────────────► save the latest pending value
//! ```
//!
//! Any number of submits inside one interval collapse into a single
//! deferred write of the most recent value, so at most one write happens
//! per `D` while the final state is always written.
//!
//! A value whose save failed stays pending until a later save of it (or of
//! a newer value) succeeds, so `flush()` never reports a dirty state clean.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::storage::StoreError;

/// The wrapped write operation.
pub type SaveFn<T> = Arc<dyn Fn(&T) -> Result<(), StoreError> + Send + Sync>;

struct State<T> {
    last_write: Option<Instant>,
    pending: Option<T>,
    timer_armed: bool,
    /// Failure of a timer-driven write, handed to the next caller
    deferred_error: Option<StoreError>,
    writes: u64,
}

struct Inner<T> {
    interval: Duration,
    save: SaveFn<T>,
    state: Mutex<State<T>>,
}

/// Debounced wrapper around a save function.
pub struct Debouncer<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F>(interval: Duration, save: F) -> Self
    where
        F: Fn(&T) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                interval,
                save: Arc::new(save),
                state: Mutex::new(State {
                    last_write: None,
                    pending: None,
                    timer_armed: false,
                    deferred_error: None,
                    writes: 0,
                }),
            }),
        }
    }

    /// Request a write of `value`.
    ///
    /// Writes immediately when the interval has elapsed, otherwise defers.
    /// Must be called from within a tokio runtime. Returns the error of an
    /// immediate write, or of an earlier deferred write that failed.
    pub fn submit(&self, value: T) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let due = state
            .last_write
            .map_or(true, |at| now.duration_since(at) >= self.inner.interval);

        let result = if due && !state.timer_armed {
            state.last_write = Some(now);
            state.writes += 1;
            let result = (self.inner.save)(&value);
            state.pending = if result.is_ok() { None } else { Some(value) };
            result
        } else {
            state.pending = Some(value);
            if !state.timer_armed {
                state.timer_armed = true;
                let fire_at = state.last_write.map_or(now, |at| at + self.inner.interval);
                Self::arm(Arc::clone(&self.inner), fire_at);
            }
            Ok(())
        };

        let deferred = Self::settle(&mut state, &result);
        drop(state);

        result?;
        deferred.map_or(Ok(()), Err)
    }

    /// Write any pending value now instead of waiting for the timer.
    ///
    /// Fails again, keeping the value pending, while storage keeps failing.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock();
        let (result, wrote) = match state.pending.take() {
            Some(value) => {
                state.last_write = Some(Instant::now());
                state.writes += 1;
                let result = (self.inner.save)(&value);
                if result.is_err() {
                    state.pending = Some(value);
                }
                (result, true)
            }
            None => (Ok(()), false),
        };
        let deferred = if wrote {
            Self::settle(&mut state, &result)
        } else {
            state.deferred_error.take()
        };
        drop(state);

        result?;
        deferred.map_or(Ok(()), Err)
    }

    /// Earlier deferred failure still owed to a caller. A successful write
    /// of the latest value supersedes it.
    fn settle(state: &mut State<T>, result: &Result<(), StoreError>) -> Option<StoreError> {
        match result {
            Ok(()) if state.pending.is_none() => {
                if let Some(e) = state.deferred_error.take() {
                    log::info!("Storage recovered after deferred save failure: {e}");
                }
                None
            }
            _ => state.deferred_error.take(),
        }
    }

    /// Number of save attempts, failed ones included.
    pub fn writes(&self) -> u64 {
        self.inner.state.lock().writes
    }

    pub fn has_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    fn arm(inner: Arc<Inner<T>>, fire_at: Instant) {
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            inner.fire();
        });
    }
}

impl<T> Inner<T> {
    fn fire(&self) {
        let mut state = self.state.lock();
        state.timer_armed = false;
        let Some(value) = state.pending.take() else {
            return;
        };
        state.last_write = Some(Instant::now());
        state.writes += 1;
        if let Err(e) = (self.save)(&value) {
            log::error!("Deferred save failed: {e}");
            state.pending = Some(value);
            state.deferred_error = Some(e);
        }
    }
}
