//! Generic keyed persistence for workflow records and definitions
//!
//! The engine only talks to [`Repository`]; [`InMemoryRepository`] is the
//! bundled backend.

use crate::error::{Result, StepflowError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Anything stored by id
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
}

impl Entity for crate::workflow::Workflow {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for crate::definition::WorkflowDefinition {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Keyed store for one entity type
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Insert or replace; returns the entity id
    async fn save(&self, entity: &T) -> Result<String>;

    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Replace an existing entity; `false` if the id is unknown
    async fn update(&self, entity: &T) -> Result<bool>;

    /// All entities whose top-level serialized fields equal every filter entry
    async fn find_all(&self, filter: Option<&Map<String, Value>>) -> Result<Vec<T>>;
}

/// In-memory repository preserving insertion order
#[derive(Debug, Clone)]
pub struct InMemoryRepository<T> {
    entries: Arc<RwLock<Entries<T>>>,
}

#[derive(Debug)]
struct Entries<T> {
    order: Vec<String>,
    by_id: HashMap<String, T>,
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries {
                order: Vec::new(),
                by_id: HashMap::new(),
            })),
        }
    }
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn matches_filter<T: Serialize>(entity: &T, filter: &Map<String, Value>) -> Result<bool> {
    let value = serde_json::to_value(entity)?;
    let fields = value.as_object().ok_or_else(|| {
        StepflowError::Persistence("entity does not serialize to an object".to_string())
    })?;
    Ok(filter
        .iter()
        .all(|(key, expected)| fields.get(key) == Some(expected)))
}

#[async_trait]
impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    async fn save(&self, entity: &T) -> Result<String> {
        let id = entity.id().to_string();
        let mut entries = self.entries.write().await;
        if entries.by_id.insert(id.clone(), entity.clone()).is_none() {
            entries.order.push(id.clone());
        }
        Ok(id)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.entries.read().await.by_id.get(id).cloned())
    }

    async fn update(&self, entity: &T) -> Result<bool> {
        let mut entries = self.entries.write().await;
        match entries.by_id.get_mut(entity.id()) {
            Some(existing) => {
                *existing = entity.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_all(&self, filter: Option<&Map<String, Value>>) -> Result<Vec<T>> {
        let entries = self.entries.read().await;
        let mut found = Vec::new();
        for id in &entries.order {
            if let Some(entity) = entries.by_id.get(id) {
                let keep = match filter {
                    Some(filter) => matches_filter(entity, filter)?,
                    None => true,
                };
                if keep {
                    found.push(entity.clone());
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Workflow, WorkflowStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_find_update() {
        let repo = InMemoryRepository::<Workflow>::new();
        let mut wf = Workflow::new("wf", "def-1");

        let id = repo.save(&wf).await.unwrap();
        assert_eq!(id, wf.id);
        assert_eq!(repo.find_by_id(&id).await.unwrap(), Some(wf.clone()));

        wf.mark_running().unwrap();
        assert!(repo.update(&wf).await.unwrap());
        assert_eq!(
            repo.find_by_id(&id).await.unwrap().unwrap().status,
            WorkflowStatus::Running
        );

        let unknown = Workflow::new("other", "def-1");
        assert!(!repo.update(&unknown).await.unwrap());
        assert!(repo.find_by_id(&unknown.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_twice_keeps_single_entry() {
        let repo = InMemoryRepository::<Workflow>::new();
        let wf = Workflow::new("wf", "def-1");
        repo.save(&wf).await.unwrap();
        repo.save(&wf).await.unwrap();
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_find_all_with_filter() {
        let repo = InMemoryRepository::<Workflow>::new();
        let a = Workflow::new("a", "def-1");
        let mut b = Workflow::new("b", "def-2");
        b.mark_running().unwrap();
        repo.save(&a).await.unwrap();
        repo.save(&b).await.unwrap();

        let all = repo.find_all(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");

        let mut filter = Map::new();
        filter.insert("status".to_string(), json!("running"));
        let running = repo.find_all(Some(&filter)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "b");

        filter.insert("definition_id".to_string(), json!("def-1"));
        assert!(repo.find_all(Some(&filter)).await.unwrap().is_empty());
    }
}
