//! The service bundle every page operation reaches through.

use crate::{drainer::Drainer, evicter::Evicter, serializer::Serializer};
use commonware_runtime::{Metrics, Spawner};
use prometheus_client::metrics::counter::Counter;

/// Shared collaborators of the page layer: the runtime context loads are
/// spawned on, the serializer blocks are read through, the evicter pages are
/// filed with, and the drainer shutdown waits on.
///
/// Cheap to clone; every [crate::page::Page] holds one.
pub struct Cache<E: Spawner + Metrics, S: Serializer> {
    context: E,
    serializer: S,
    evicter: Evicter,
    drainer: Drainer,

    loads: Counter,
    load_aborts: Counter,
}

impl<E: Spawner + Metrics, S: Serializer> Cache<E, S> {
    pub fn new(context: E, serializer: S) -> Self {
        let evicter = Evicter::new(&context);
        let loads = Counter::default();
        context.register("loads", "Number of block loads committed", loads.clone());
        let load_aborts = Counter::default();
        context.register(
            "load_aborts",
            "Number of loads discarded because their page was destroyed",
            load_aborts.clone(),
        );
        Self {
            context,
            serializer,
            evicter,
            drainer: Drainer::new(),
            loads,
            load_aborts,
        }
    }

    pub fn context(&self) -> &E {
        &self.context
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    pub fn evicter(&self) -> &Evicter {
        &self.evicter
    }

    pub fn drainer(&self) -> &Drainer {
        &self.drainer
    }

    pub(crate) fn loads(&self) -> &Counter {
        &self.loads
    }

    pub(crate) fn load_aborts(&self) -> &Counter {
        &self.load_aborts
    }
}

impl<E: Spawner + Metrics, S: Serializer> Clone for Cache<E, S> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            serializer: self.serializer.clone(),
            evicter: self.evicter.clone(),
            drainer: self.drainer.clone(),
            loads: self.loads.clone(),
            load_aborts: self.load_aborts.clone(),
        }
    }
}
