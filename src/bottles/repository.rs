// Repository pattern - isolates all persistence side effects of the bottle store
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::kv::{self, KvStore, StorageError};

use super::domain::Bottle;
use super::history::RetrievalHistory;

/// Outcome of loading one namespace at startup
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadCounts {
    pub ok: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct LoadedState {
    pub bottles: HashMap<String, Vec<Bottle>>,
    pub history: HashMap<String, RetrievalHistory>,
    pub bottle_counts: LoadCounts,
    pub history_counts: LoadCounts,
}

pub struct BottleRepository {
    kv: Arc<dyn KvStore>,
    bottle_namespace: String,
    history_namespace: String,
}

impl BottleRepository {
    pub fn new(
        kv: Arc<dyn KvStore>,
        bottle_namespace: impl Into<String>,
        history_namespace: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            bottle_namespace: bottle_namespace.into(),
            history_namespace: history_namespace.into(),
        }
    }

    /// Load every author record and every history record.
    ///
    /// A record that cannot be read or parsed is skipped and counted; the
    /// user simply starts with an empty record.
    pub async fn load_all(&self) -> Result<LoadedState, StorageError> {
        let mut state = LoadedState::default();

        for author in self.kv.keys(&self.bottle_namespace).await? {
            let key = kv::record_key(&self.bottle_namespace, &author);
            match kv::load_json::<Vec<Bottle>>(self.kv.as_ref(), &key).await {
                Ok(Some(bottles)) => {
                    state.bottles.insert(author, bottles);
                    state.bottle_counts.ok += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping bottle record {}: {}", key, e);
                    state.bottle_counts.failed += 1;
                }
            }
        }

        for user in self.kv.keys(&self.history_namespace).await? {
            let key = kv::record_key(&self.history_namespace, &user);
            match kv::load_json::<Vec<u64>>(self.kv.as_ref(), &key).await {
                Ok(Some(ids)) => {
                    state.history.insert(user, RetrievalHistory::from_ids(ids));
                    state.history_counts.ok += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping history record {}: {}", key, e);
                    state.history_counts.failed += 1;
                }
            }
        }

        Ok(state)
    }

    /// Persist one author's full bottle list
    pub async fn save_author(&self, author_id: &str, bottles: &[Bottle]) -> Result<(), StorageError> {
        let key = kv::record_key(&self.bottle_namespace, author_id);
        kv::save_json(self.kv.as_ref(), &key, bottles).await
    }

    /// Persist one user's retrieval history
    pub async fn save_history(
        &self,
        user_id: &str,
        history: &RetrievalHistory,
    ) -> Result<(), StorageError> {
        let key = kv::record_key(&self.history_namespace, user_id);
        kv::save_json(self.kv.as_ref(), &key, history).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottles::domain::BottleContent;
    use crate::db::{self, SqliteKvStore};
    use chrono::Utc;
    use tempfile::TempDir;

    fn create_test_repo() -> (BottleRepository, Arc<dyn KvStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = db::create_pool(&temp_dir.path().join("test.db")).unwrap();
        db::run_migrations(&pool).unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(pool));

        (BottleRepository::new(kv.clone(), "b", "h"), kv, temp_dir)
    }

    fn bottle(id: u64, author: &str) -> Bottle {
        Bottle {
            id,
            style: 0,
            content: BottleContent {
                text: Some(format!("bottle {}", id)),
                images: None,
                audio: None,
                title: None,
                created_at: Utc::now(),
                author_id: author.to_string(),
                author_name: None,
            },
            retrieval_count: 0,
            visible: true,
            author_id: author.to_string(),
            comments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let (repo, _kv, _temp) = create_test_repo();

        repo.save_author("alice", &[bottle(1, "alice"), bottle(3, "alice")])
            .await
            .unwrap();
        repo.save_author("bob", &[bottle(2, "bob")]).await.unwrap();
        repo.save_history("bob", &RetrievalHistory::from_ids(vec![1, 3]))
            .await
            .unwrap();

        let state = repo.load_all().await.unwrap();
        assert_eq!(state.bottles["alice"].len(), 2);
        assert_eq!(state.bottles["bob"][0].id, 2);
        assert_eq!(state.history["bob"].ids(), &[1, 3]);
        assert_eq!(state.bottle_counts, LoadCounts { ok: 2, failed: 0 });
        assert_eq!(state.history_counts, LoadCounts { ok: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_corrupt_records_are_skipped_and_counted() {
        let (repo, kv, _temp) = create_test_repo();

        repo.save_author("alice", &[bottle(1, "alice")]).await.unwrap();
        kv.set("b/mallory", "{{{").await.unwrap();
        kv.set("h/mallory", "not a list").await.unwrap();

        let state = repo.load_all().await.unwrap();
        assert_eq!(state.bottles.len(), 1);
        assert!(!state.bottles.contains_key("mallory"));
        assert_eq!(state.bottle_counts, LoadCounts { ok: 1, failed: 1 });
        assert_eq!(state.history_counts, LoadCounts { ok: 0, failed: 1 });
    }
}
