//! Driver registries: mechanism id → factory.
//!
//! Two registries exist per process (or per endpoint, when passed into the
//! connection configuration explicitly): one for provers, one for
//! verifiers. Registration is rare and lookups are hot, so a plain
//! `RwLock<HashMap>` is enough. Driver-specific configuration is captured
//! by the factory closure at registration time.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use tracing::warn;

use crate::fsm::queue::EventQueue;
use crate::rat::driver::{
    spawn_prover, spawn_verifier, DriverHandle, RatDriverError, RatProverDriver,
    RatVerifierDriver,
};
use crate::rat::dummy::{DummyRatProver, DummyRatVerifier, DUMMY_RAT_ID};

type ProverFactory = Arc<dyn Fn() -> Result<Box<dyn RatProverDriver>, RatDriverError> + Send + Sync>;
type VerifierFactory =
    Arc<dyn Fn() -> Result<Box<dyn RatVerifierDriver>, RatDriverError> + Send + Sync>;

/// Registry of prover driver factories.
#[derive(Default)]
pub struct RatProverRegistry {
    factories: RwLock<HashMap<String, ProverFactory>>,
}

impl RatProverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a mechanism id, replacing any previous one.
    pub fn register<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn RatProverDriver>, RatDriverError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(id.into(), Arc::new(factory));
    }

    pub fn unregister(&self, id: &str) {
        self.factories.write().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().unwrap().contains_key(id)
    }

    /// Instantiate and start the driver registered under `id`. Unknown ids
    /// and factory failures are logged and yield `None`, which the FSM
    /// treats as a prover failure.
    pub(crate) fn start(
        &self,
        id: &str,
        events: Arc<EventQueue>,
        generation: u64,
        grace: Duration,
    ) -> Option<DriverHandle> {
        let factory = self.factories.read().unwrap().get(id).cloned();
        let Some(factory) = factory else {
            warn!(%id, "no RAT prover registered under this id");
            return None;
        };
        match factory() {
            Ok(driver) => Some(spawn_prover(driver, events, generation, grace)),
            Err(e) => {
                warn!(%id, error = %e, "RAT prover factory failed");
                None
            }
        }
    }
}

/// Registry of verifier driver factories.
#[derive(Default)]
pub struct RatVerifierRegistry {
    factories: RwLock<HashMap<String, VerifierFactory>>,
}

impl RatVerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Box<dyn RatVerifierDriver>, RatDriverError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(id.into(), Arc::new(factory));
    }

    pub fn unregister(&self, id: &str) {
        self.factories.write().unwrap().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().unwrap().contains_key(id)
    }

    pub(crate) fn start(
        &self,
        id: &str,
        events: Arc<EventQueue>,
        generation: u64,
        grace: Duration,
    ) -> Option<DriverHandle> {
        let factory = self.factories.read().unwrap().get(id).cloned();
        let Some(factory) = factory else {
            warn!(%id, "no RAT verifier registered under this id");
            return None;
        };
        match factory() {
            Ok(driver) => Some(spawn_verifier(driver, events, generation, grace)),
            Err(e) => {
                warn!(%id, error = %e, "RAT verifier factory failed");
                None
            }
        }
    }
}

/// The prover and verifier registries a connection resolves drivers from.
#[derive(Default)]
pub struct RatRegistries {
    pub provers: RatProverRegistry,
    pub verifiers: RatVerifierRegistry,
}

impl RatRegistries {
    /// Empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registries with the dummy mechanism pre-registered.
    pub fn with_dummy() -> Self {
        let registries = Self::new();
        registries.provers.register(DUMMY_RAT_ID, || {
            Ok(Box::new(DummyRatProver) as Box<dyn RatProverDriver>)
        });
        registries.verifiers.register(DUMMY_RAT_ID, || {
            Ok(Box::new(DummyRatVerifier) as Box<dyn RatVerifierDriver>)
        });
        registries
    }
}

/// The process-wide default registries, used when a configuration does not
/// carry explicit ones. The dummy mechanism is pre-registered.
pub fn default_registries() -> Arc<RatRegistries> {
    static DEFAULT: LazyLock<Arc<RatRegistries>> =
        LazyLock::new(|| Arc::new(RatRegistries::with_dummy()));
    DEFAULT.clone()
}
