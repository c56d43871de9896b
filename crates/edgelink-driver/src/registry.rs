use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name -> live session mapping shared by the drivers.
///
/// The lock is held only for the map operation itself, never across
/// session I/O; callers fetch a handle, release the lock, then open or
/// close.
pub struct Registry<T> {
    entries: Arc<RwLock<HashMap<String, Arc<T>>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `value` under `name`, returning whatever it replaced
    pub async fn insert(&self, name: &str, value: Arc<T>) -> Option<Arc<T>> {
        let mut entries = self.entries.write().await;
        let previous = entries.insert(name.to_string(), value);

        tracing::debug!(
            name = %name,
            replaced = previous.is_some(),
            entries = entries.len(),
            "Registry entry stored"
        );
        previous
    }

    pub async fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<T>> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(name);

        if removed.is_some() {
            tracing::debug!(name = %name, entries = entries.len(), "Registry entry removed");
        }
        removed
    }

    /// Number of registered entries
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_insert_get_remove() {
        let registry: Registry<String> = Registry::new();

        assert!(registry.get("web").await.is_none());
        assert!(registry
            .insert("web", Arc::new("first".to_string()))
            .await
            .is_none());
        assert_eq!(registry.get("web").await.unwrap().as_str(), "first");

        let previous = registry.insert("web", Arc::new("second".to_string())).await;
        assert_eq!(previous.unwrap().as_str(), "first");
        assert_eq!(registry.get("web").await.unwrap().as_str(), "second");
        assert_eq!(registry.count().await, 1);

        assert_eq!(registry.remove("web").await.unwrap().as_str(), "second");
        assert!(registry.remove("web").await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_clones_share_entries() {
        let registry: Registry<u32> = Registry::new();
        let other = registry.clone();

        registry.insert("a", Arc::new(1)).await;
        other.insert("b", Arc::new(2)).await;

        assert_eq!(registry.count().await, 2);
        assert_eq!(*other.get("a").await.unwrap(), 1);
    }
}
