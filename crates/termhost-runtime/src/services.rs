//! Service registry: singleton collaborators looked up by type.
//!
//! The runtime constructs one registry at start-up and hands it to every
//! component that needs to resolve a collaborator. Services are stored as
//! `Arc<T>` keyed by `TypeId::of::<T>()`, where `T` may be a trait object
//! (`dyn ThemeSink`) as well as a concrete type.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RuntimeError;

struct Entry {
    /// Holds an `Arc<T>` for the key's `T`.
    instance: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Process-wide lookup of collaborator instances by capability type.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<TypeId, Entry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the instance for `T`, replacing any previous one.
    pub fn register<T>(&self, instance: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let replaced = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                TypeId::of::<T>(),
                Entry {
                    instance: Box::new(instance),
                    type_name: type_name::<T>(),
                },
            )
            .is_some();
        tracing::debug!(service = type_name::<T>(), replaced, "service registered");
    }

    /// Resolve the instance registered for `T`.
    ///
    /// A missing service is a wiring error on the caller's side; it is
    /// logged at error level and returned as
    /// [`RuntimeError::ServiceNotRegistered`].
    pub fn resolve<T>(&self) -> Result<Arc<T>, RuntimeError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let services = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match services
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.instance.downcast_ref::<Arc<T>>())
        {
            Some(instance) => Ok(Arc::clone(instance)),
            None => {
                tracing::error!(service = type_name::<T>(), "service not registered");
                Err(RuntimeError::ServiceNotRegistered(type_name::<T>()))
            }
        }
    }

    /// Whether an instance is registered for `T`.
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// Names of the registered service types.
    pub fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.type_name)
            .collect();
        names.sort_unstable();
        names
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
