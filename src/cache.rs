// file: cache.rs
// desc: load-once model cache shared by every prediction

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};

use crate::error::LoadError;

/// Produces a ready-to-run model.
///
/// The cache calls [`ModelLoader::load`] at most once per load attempt no
/// matter how many callers are waiting.
pub trait ModelLoader: Send + Sync {
    /// Handed out by value on every hit, so cloning should be cheap. Burn
    /// modules share their parameter storage between clones.
    type Model: Clone + Send + 'static;

    fn load(&self) -> BoxFuture<'static, Result<Self::Model, LoadError>>;
}

/// What [`ModelCache::state`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unloaded,
    Loading,
    Loaded,
}

type Flight = Shared<BoxFuture<'static, Result<(), LoadError>>>;

enum Slot<M> {
    Unloaded,
    Loading { flight: Flight, abort: AbortHandle },
    Loaded(M),
}

struct Inner<M> {
    slot: Slot<M>,
    // bumped for every load attempt so a stale flight never touches the slot
    generation: u64,
}

/// Single-flight cache around a [`ModelLoader`].
///
/// Callers arriving while a load is in flight await that same load and
/// see the same outcome. A failed or cancelled load leaves the cache
/// unloaded, and the next call starts a fresh attempt.
pub struct ModelCache<L: ModelLoader> {
    loader: L,
    inner: Arc<Mutex<Inner<L::Model>>>,
}

enum Lookup<M> {
    Hit(M),
    Wait(Flight),
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            inner: Arc::new(Mutex::new(Inner {
                slot: Slot::Unloaded,
                generation: 0,
            })),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self) -> CacheState {
        match lock(&self.inner).slot {
            Slot::Unloaded => CacheState::Unloaded,
            Slot::Loading { .. } => CacheState::Loading,
            Slot::Loaded(_) => CacheState::Loaded,
        }
    }

    /// Returns the loaded model, loading it first if needed.
    pub async fn ensure_loaded(&self) -> Result<L::Model, LoadError> {
        loop {
            match self.lookup() {
                Lookup::Hit(model) => return Ok(model),
                // on success the slot is filled and the next lookup hits,
                // unless someone evicted in between
                Lookup::Wait(flight) => flight.await?,
            }
        }
    }

    /// Aborts an in-flight load. Everyone waiting on it gets
    /// [`LoadError::Cancelled`]. Returns whether there was a load to cancel.
    pub fn cancel(&self) -> bool {
        let mut inner = lock(&self.inner);
        match &inner.slot {
            Slot::Loading { abort, .. } => {
                abort.abort();
                inner.slot = Slot::Unloaded;
                log::warn!("Model load #{} cancelled", inner.generation);
                true
            }
            _ => false,
        }
    }

    /// Drops a loaded model so the next call fetches it again. Models
    /// already handed out stay usable. Returns whether anything was dropped.
    pub fn evict(&self) -> bool {
        let mut inner = lock(&self.inner);
        if !matches!(inner.slot, Slot::Loaded(_)) {
            return false;
        }
        inner.slot = Slot::Unloaded;
        log::info!("Evicted cached model");
        true
    }

    fn lookup(&self) -> Lookup<L::Model> {
        let mut inner = lock(&self.inner);

        match &inner.slot {
            Slot::Loaded(model) => return Lookup::Hit(model.clone()),
            Slot::Loading { flight, .. } => return Lookup::Wait(flight.clone()),
            Slot::Unloaded => {}
        }

        inner.generation += 1;
        let generation = inner.generation;
        log::info!("Starting model load #{}", generation);

        let (abort, registration) = AbortHandle::new_pair();
        let load = Abortable::new(self.loader.load(), registration);
        let slot = Arc::downgrade(&self.inner);

        let flight = async move {
            let outcome = match AssertUnwindSafe(load).catch_unwind().await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_aborted)) => Err(LoadError::Cancelled),
                Err(panic) => Err(LoadError::Panicked(panic_message(panic.as_ref()))),
            };
            settle(&slot, generation, outcome)
        }
        .boxed()
        .shared();

        inner.slot = Slot::Loading {
            flight: flight.clone(),
            abort,
        };
        Lookup::Wait(flight)
    }
}

/// Moves the outcome of load `generation` into the slot, provided that
/// load is still the current one.
fn settle<M>(
    slot: &Weak<Mutex<Inner<M>>>,
    generation: u64,
    outcome: Result<M, LoadError>,
) -> Result<(), LoadError> {
    let Some(inner) = slot.upgrade() else {
        return outcome.map(drop);
    };
    let mut inner = lock(&inner);
    let current = inner.generation == generation && matches!(inner.slot, Slot::Loading { .. });

    match outcome {
        Ok(model) => {
            if current {
                inner.slot = Slot::Loaded(model);
                log::info!("Model load #{} complete", generation);
            }
            Ok(())
        }
        Err(err) => {
            if current {
                inner.slot = Slot::Unloaded;
                log::error!("Model load #{} failed: {}", generation, err);
            }
            Err(err)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<M>(inner: &Mutex<Inner<M>>) -> MutexGuard<'_, Inner<M>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
