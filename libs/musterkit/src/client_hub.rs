//! Type-keyed registry through which modules hand shared handles to the
//! modules that depend on them.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Default)]
pub struct ClientHub {
    clients: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a handle. A later registration of the same type replaces it.
    pub fn register<T>(&self, client: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.clients.insert(TypeId::of::<T>(), client);
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let entry = self.clients.get(&TypeId::of::<T>())?;
        Arc::clone(entry.value()).downcast::<T>().ok()
    }

    /// Like [`ClientHub::get`], but a missing handle is an error naming the type.
    pub fn require<T>(&self) -> anyhow::Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "client '{}' is not registered in the client hub",
                std::any::type_name::<T>()
            )
        })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ClientHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHub")
            .field("clients", &self.clients.len())
            .finish()
    }
}
