//! Microcontrollers and the per-attribute registry that caches them.
//!
//! A microcontroller drives one attribute toward its desired configuration.
//! The registry builds one lazily per attribute identity from a kind-keyed
//! factory table and keeps it for the identity's lifetime, so a worker can
//! hold private state (a client, a resolved binary path) across attempts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{ActualStatus, AttributeKind, DesiredAttribute};

/// Outcome of one microcontroller invocation.
#[derive(Debug)]
pub struct Attempt {
    pub status: ActualStatus,
    pub info: String,
    /// Recorded into the attribute's `Error` field when set.
    pub error: Option<anyhow::Error>,
}

impl Attempt {
    /// Successful, finished attempt.
    pub fn finished(info: impl Into<String>) -> Self {
        Self {
            status: ActualStatus::Finished,
            info: info.into(),
            error: None,
        }
    }

    /// Attempt that made progress without finishing and without failing.
    pub fn progress(status: ActualStatus, info: impl Into<String>) -> Self {
        Self {
            status,
            info: info.into(),
            error: None,
        }
    }

    /// Failed attempt.
    pub fn failed(status: ActualStatus, info: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            info: info.into(),
            error: Some(error.into()),
        }
    }
}

/// Drives one attribute's actual state toward a desired configuration.
///
/// Implementations should honor `cancel`; the achiever does not abort a
/// running invocation.
#[async_trait]
pub trait Microcontroller: Send {
    async fn achieve(&mut self, cancel: &CancellationToken, desired: &DesiredAttribute) -> Attempt;
}

/// Adapter turning an async closure into a [`Microcontroller`].
pub struct FnMicrocontroller<F>(F);

/// Build a microcontroller from `f(cancel, desired)`.
pub fn from_fn<F, Fut>(f: F) -> FnMicrocontroller<F>
where
    F: FnMut(CancellationToken, DesiredAttribute) -> Fut + Send,
    Fut: Future<Output = Attempt> + Send + 'static,
{
    FnMicrocontroller(f)
}

#[async_trait]
impl<F, Fut> Microcontroller for FnMicrocontroller<F>
where
    F: FnMut(CancellationToken, DesiredAttribute) -> Fut + Send,
    Fut: Future<Output = Attempt> + Send + 'static,
{
    async fn achieve(&mut self, cancel: &CancellationToken, desired: &DesiredAttribute) -> Attempt {
        (self.0)(cancel.clone(), desired.clone()).await
    }
}

/// Constructor for a fresh microcontroller.
pub type MicrocontrollerFactory = Arc<dyn Fn() -> Box<dyn Microcontroller> + Send + Sync>;

/// Factory table keyed by attribute kind.
#[derive(Clone, Default)]
pub struct Factories {
    table: HashMap<AttributeKind, MicrocontrollerFactory>,
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `kind`, replacing any previous one.
    pub fn register<F, M>(&mut self, kind: AttributeKind, factory: F) -> &mut Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Microcontroller + 'static,
    {
        self.table.insert(
            kind,
            Arc::new(move || Box::new(factory()) as Box<dyn Microcontroller>),
        );
        self
    }

    /// Builder form of [`Factories::register`].
    pub fn with<F, M>(mut self, kind: AttributeKind, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Microcontroller + 'static,
    {
        self.register(kind, factory);
        self
    }

    pub fn get(&self, kind: AttributeKind) -> Option<&MicrocontrollerFactory> {
        self.table.get(&kind)
    }

    pub fn contains(&self, kind: AttributeKind) -> bool {
        self.table.contains_key(&kind)
    }
}

impl fmt::Debug for Factories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.table.keys()).finish()
    }
}

/// Cache of constructed microcontrollers, one per `(kind, id)`.
pub struct Registry {
    factories: Factories,
    controllers: HashMap<(AttributeKind, String), Box<dyn Microcontroller>>,
}

impl Registry {
    pub fn new(factories: Factories) -> Self {
        Self {
            factories,
            controllers: HashMap::new(),
        }
    }

    /// Return the microcontroller for `id`, constructing it on first use.
    ///
    /// # Panics
    ///
    /// Panics if no factory is registered for `kind`. The factory table is
    /// fixed at startup, so a missing kind is a wiring bug rather than a
    /// condition a retry could fix.
    pub fn get_or_create(&mut self, kind: AttributeKind, id: &str) -> &mut dyn Microcontroller {
        let factories = &self.factories;
        self.controllers
            .entry((kind, id.to_string()))
            .or_insert_with(|| {
                let Some(factory) = factories.get(kind) else {
                    panic!("no microcontroller factory registered for {kind} (attribute {id:?})");
                };
                debug!(id, kind = %kind, "Constructing microcontroller");
                factory()
            })
            .as_mut()
    }

    /// Drop every microcontroller for which `keep(kind, id)` is false.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(AttributeKind, &str) -> bool,
    {
        self.controllers.retain(|(kind, id), _| {
            let kept = keep(*kind, id);
            if !kept {
                debug!(id = %id, kind = %kind, "Dropping microcontroller");
            }
            kept
        });
    }

    /// Number of constructed microcontrollers.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("factories", &self.factories)
            .field("controllers", &self.controllers.len())
            .finish()
    }
}
