//! Single-writer, many-reader publication cell.
//!
//! Default uses `ArcSwap` for lock-free reads; building without the `arc-swap`
//! feature switches to an `RwLock<Arc<T>>` whose read lock is held only long
//! enough to clone the `Arc`.
//!
//! Writers are serialized by a separate mutex and build their new value off to
//! the side, so readers never wait for a writer's work and never see a
//! half-built value.

use std::sync::{Arc, Mutex, PoisonError};

#[cfg(not(feature = "arc-swap"))]
use std::sync::RwLock;

#[cfg(feature = "arc-swap")]
use arc_swap::ArcSwap;

/// `Published<T>` gives cheap snapshots and serialized, atomic replacement.
#[derive(Debug)]
pub struct Published<T> {
    #[cfg(feature = "arc-swap")]
    current: ArcSwap<T>,
    #[cfg(not(feature = "arc-swap"))]
    current: RwLock<Arc<T>>,
    writer: Mutex<()>,
}

impl<T: Default> Default for Published<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Published<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        #[cfg(feature = "arc-swap")]
        {
            Self { current: ArcSwap::from_pointee(value), writer: Mutex::new(()) }
        }
        #[cfg(not(feature = "arc-swap"))]
        {
            Self { current: RwLock::new(Arc::new(value)), writer: Mutex::new(()) }
        }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn load(&self) -> Arc<T> {
        #[cfg(feature = "arc-swap")]
        {
            self.current.load_full()
        }
        #[cfg(not(feature = "arc-swap"))]
        {
            self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    fn store(&self, value: Arc<T>) {
        #[cfg(feature = "arc-swap")]
        {
            self.current.store(value);
        }
        #[cfg(not(feature = "arc-swap"))]
        {
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = value;
        }
    }

    /// Replace the value entirely.
    pub fn publish(&self, value: T) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.store(Arc::new(value));
    }

    /// Infallible form of [`edit`](Self::edit).
    pub fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> (Option<T>, R),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let cur = self.load();
        let (next, out) = f(&cur);
        if let Some(next) = next {
            self.store(Arc::new(next));
        }
        out
    }

    /// Run `f` against the current value while holding the writer lock.
    ///
    /// `Ok((Some(next), out))` publishes `next`; `Ok((None, out))` leaves the
    /// current value in place. An `Err` publishes nothing.
    pub fn edit<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&T) -> Result<(Option<T>, R), E>,
    {
        self.update(|cur| match f(cur) {
            Ok((next, out)) => (next, Ok(out)),
            Err(e) => (None, Err(e)),
        })
    }
}
