//! Run-scoped shared data cache.
//!
//! Some data is expensive to compute and needed by several units, for example
//! the set of usernames already taken in the target. The cache memoizes such
//! values by name for the lifetime of one run.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{ImportError, Result};

type Entry = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

/// Cache of lazily initialized, typed values shared between units.
#[derive(Default)]
pub struct SharedCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `name`, initializing it with `init` on first use.
    ///
    /// `init` runs at most once per name. A failed initialization leaves the
    /// entry empty, so the next caller retries. Asking for a different type
    /// than the one stored is a configuration error.
    pub async fn get_or_try_init<T, F, Fut>(&self, name: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = self.entry(name)?;
        let value = cell
            .get_or_try_init(|| async {
                debug!("Initializing shared cache entry '{}'", name);
                let value = init().await?;
                Ok::<_, ImportError>(Arc::new(value) as Arc<dyn Any + Send + Sync>)
            })
            .await?
            .clone();

        value.downcast::<T>().map_err(|_| {
            ImportError::Config(format!(
                "shared cache entry '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Get an already initialized value.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>> {
        let Some(value) = self.entry(name)?.get().cloned() else {
            return Ok(None);
        };
        value.downcast::<T>().map(Some).map_err(|_| {
            ImportError::Config(format!(
                "shared cache entry '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Number of names ever requested.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, name: &str) -> Result<Entry> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ImportError::Config("shared cache lock poisoned".to_string()))?;
        Ok(entries.entry(name.to_string()).or_default().clone())
    }
}
