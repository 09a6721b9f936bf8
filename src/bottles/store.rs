// Bottle store - owns every bottle, comment and retrieval history
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;

use crate::activity::{ActivityEntry, ActivityLog, EventKind};
use crate::db::StorageError;
use crate::error::{BottleError, BottleResult};
use crate::media::{self, MediaKind, MediaStore};
use crate::moderation::ContentModerator;
use crate::stats::{self, Summary};

use super::domain::{
    sanitize_text, Bottle, BottleContent, BottleId, BottleKind, Comment, CommentRemoval, Created,
    Draft, Requester,
};
use super::history::RetrievalHistory;
use super::repository::{BottleRepository, LoadCounts};

/// Startup summary returned by [`BottleStore::load`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub bottles: LoadCounts,
    pub history: LoadCounts,
    pub max_id: BottleId,
    pub fixed_paths: usize,
}

/// One retrieval history line; `kind` is `None` when the bottle is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub id: BottleId,
    pub kind: Option<BottleKind>,
}

#[derive(Default)]
struct BottleIndex {
    bottles: BTreeMap<BottleId, Bottle>,
    authors: HashMap<String, Vec<BottleId>>,
    history: HashMap<String, RetrievalHistory>,
    /// Last allocated id
    last_id: BottleId,
}

impl BottleIndex {
    /// Index a bottle. An id already held by another author moves to the
    /// newcomer so each id is listed under exactly one author.
    fn insert(&mut self, bottle: Bottle) {
        self.last_id = self.last_id.max(bottle.id);
        if let Some(previous) = self.bottles.get(&bottle.id) {
            if previous.author_id != bottle.author_id {
                tracing::warn!(
                    "Bottle id {} is claimed by both {} and {}, keeping the copy from {}",
                    bottle.id,
                    previous.author_id,
                    bottle.author_id,
                    bottle.author_id
                );
                let previous_author = previous.author_id.clone();
                if let Some(ids) = self.authors.get_mut(&previous_author) {
                    ids.retain(|&existing| existing != bottle.id);
                }
            }
        }
        let ids = self.authors.entry(bottle.author_id.clone()).or_default();
        if !ids.contains(&bottle.id) {
            ids.push(bottle.id);
        }
        self.bottles.insert(bottle.id, bottle);
    }

    fn remove(&mut self, id: BottleId) {
        if let Some(bottle) = self.bottles.remove(&id) {
            if let Some(ids) = self.authors.get_mut(&bottle.author_id) {
                ids.retain(|&existing| existing != id);
            }
        }
    }

    fn allocate_id(&mut self) -> BottleId {
        self.last_id += 1;
        self.last_id
    }

    fn authored_by(&self, author_id: &str) -> Vec<Bottle> {
        self.authors
            .get(author_id)
            .map(|ids| ids.iter().filter_map(|id| self.bottles.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    fn has_retrieved(&self, user_id: &str, id: BottleId) -> bool {
        self.history.get(user_id).is_some_and(|h| h.contains(id))
    }

    fn get(&self, id: BottleId) -> BottleResult<&Bottle> {
        self.bottles.get(&id).ok_or(BottleError::NotFound(id))
    }

    fn get_mut(&mut self, id: BottleId) -> BottleResult<&mut Bottle> {
        self.bottles.get_mut(&id).ok_or(BottleError::NotFound(id))
    }

    /// Who may read a bottle by id: admins, or users holding it in their history.
    fn check_readable(&self, requester: &Requester, id: BottleId) -> BottleResult<&Bottle> {
        if !requester.is_admin && !self.has_retrieved(&requester.id, id) {
            return Err(BottleError::NotRetrieved(id));
        }
        let bottle = self.get(id)?;
        if !bottle.visible {
            return Err(BottleError::Hidden(id));
        }
        Ok(bottle)
    }

    fn check_commentable(&self, requester: &Requester, id: BottleId) -> BottleResult<()> {
        let bottle = self.get(id)?;
        if bottle.is_audio() {
            return Err(BottleError::AudioBottle(id));
        }
        if !requester.is_admin && !self.has_retrieved(&requester.id, id) {
            return Err(BottleError::NotRetrieved(id));
        }
        if !bottle.visible {
            return Err(BottleError::Hidden(id));
        }
        Ok(())
    }
}

pub struct BottleStore {
    repo: BottleRepository,
    media: Arc<dyn MediaStore>,
    moderator: Arc<ContentModerator>,
    activity: Arc<ActivityLog>,
    style: u8,
    index: Mutex<BottleIndex>,
}

impl BottleStore {
    pub fn new(
        repo: BottleRepository,
        media: Arc<dyn MediaStore>,
        moderator: Arc<ContentModerator>,
        activity: Arc<ActivityLog>,
        style: u8,
    ) -> Self {
        Self {
            repo,
            media,
            moderator,
            activity,
            style,
            index: Mutex::new(BottleIndex::default()),
        }
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Load every persisted record into memory.
    ///
    /// With `media_root`, dangling local media references are pointed at the
    /// same file name under `media_root` and the affected authors re-saved.
    pub async fn load(&self, media_root: Option<&Path>) -> Result<LoadReport, StorageError> {
        let state = self.repo.load_all().await?;
        let mut index = self.index.lock().await;
        *index = BottleIndex::default();

        for bottle in state.bottles.into_values().flatten() {
            index.insert(bottle);
        }
        index.history = state.history;

        let mut report = LoadReport {
            bottles: state.bottle_counts,
            history: state.history_counts,
            max_id: index.last_id,
            fixed_paths: 0,
        };

        if let Some(root) = media_root {
            let mut touched = HashSet::new();
            for bottle in index.bottles.values_mut() {
                let author = bottle.author_id.clone();
                for (reference, kind) in bottle.media_refs_mut() {
                    if let Some(fixed) = media::relocate(root, reference, kind) {
                        *reference = fixed;
                        report.fixed_paths += 1;
                        touched.insert(author.clone());
                    }
                }
            }
            for author in &touched {
                self.repo.save_author(author, &index.authored_by(author)).await?;
            }
            if report.fixed_paths > 0 {
                tracing::info!("Repaired {} media path(s) for {} author(s)", report.fixed_paths, touched.len());
            }
        }

        tracing::info!(
            "Loaded bottles for {} author(s) ({} failed), history for {} user(s) ({} failed), max id {}",
            report.bottles.ok,
            report.bottles.failed,
            report.history.ok,
            report.history.failed,
            report.max_id
        );
        Ok(report)
    }

    pub async fn create(&self, requester: &Requester, draft: Draft) -> BottleResult<Created> {
        let text = sanitize_text(draft.text.as_deref());
        let title = sanitize_text(draft.title.as_deref());
        if text.is_none() && draft.images.is_empty() && draft.audio.is_empty() {
            return Err(BottleError::EmptyContent);
        }

        let text = match text {
            Some(text) => Some(self.moderator.audit_text(&text).await),
            None => None,
        };
        let title = match title {
            Some(title) => Some(self.moderator.audit_text(&title).await),
            None => None,
        };
        let screened = self.moderator.audit_images(draft.images).await;

        let (images, audio) = futures::join!(
            media::store_all(self.media.as_ref(), &screened.images, MediaKind::Image),
            media::store_all(self.media.as_ref(), &draft.audio, MediaKind::Audio),
        );

        if text.is_none() && images.references.is_empty() && audio.references.is_empty() {
            return Err(BottleError::EmptyContent);
        }

        let content = BottleContent {
            text,
            images: non_empty(images.references),
            audio: non_empty(audio.references),
            title,
            created_at: Utc::now(),
            author_id: requester.id.clone(),
            author_name: requester.display_name.clone(),
        };

        let (id, kind) = {
            let mut index = self.index.lock().await;
            let id = index.allocate_id();
            let bottle = Bottle {
                id,
                style: self.style,
                content,
                retrieval_count: 0,
                visible: true,
                author_id: requester.id.clone(),
                comments: Vec::new(),
            };
            let kind = bottle.kind();
            index.insert(bottle);

            if let Err(e) = self.save_author(&index, &requester.id).await {
                // The id stays burned so it is never handed out twice
                index.remove(id);
                return Err(e.into());
            }
            (id, kind)
        };

        tracing::info!("User {} threw bottle {} ({})", requester.id, id, kind);
        self.record(&requester.id, ActivityEntry::new(EventKind::Published, &requester.id, id, kind))
            .await;

        Ok(Created {
            id,
            kind,
            filtered_images: screened.flagged,
        })
    }

    /// Pick a uniformly random visible bottle.
    pub async fn retrieve_random(&self, requester: &Requester) -> BottleResult<Bottle> {
        let (bottle, first_time) = {
            let mut index = self.index.lock().await;
            let visible: Vec<BottleId> = index
                .bottles
                .values()
                .filter(|bottle| bottle.visible)
                .map(|bottle| bottle.id)
                .collect();
            if visible.is_empty() {
                return Err(BottleError::EmptyPool);
            }
            let pick = rand::thread_rng().gen_range(0..visible.len());
            self.commit_retrieval(&mut index, requester, visible[pick]).await?
        };

        self.record_retrieval(requester, &bottle, first_time).await;
        Ok(bottle)
    }

    /// Authorization is checked before existence, then visibility.
    pub async fn retrieve_by_id(&self, requester: &Requester, id: BottleId) -> BottleResult<Bottle> {
        let (bottle, first_time) = {
            let mut index = self.index.lock().await;
            index.check_readable(requester, id)?;
            self.commit_retrieval(&mut index, requester, id).await?
        };

        self.record_retrieval(requester, &bottle, first_time).await;
        Ok(bottle)
    }

    /// Append a comment and return its 1-based position.
    pub async fn add_comment(&self, requester: &Requester, id: BottleId, draft: Draft) -> BottleResult<usize> {
        self.index.lock().await.check_commentable(requester, id)?;

        let text = sanitize_text(draft.text.as_deref());
        if text.is_none() && draft.images.is_empty() {
            return Err(BottleError::EmptyContent);
        }

        let text = match text {
            Some(text) => Some(self.moderator.audit_text(&text).await),
            None => None,
        };
        let screened = self.moderator.audit_images(draft.images).await;
        let images = media::store_all(self.media.as_ref(), &screened.images, MediaKind::Image).await;

        if text.is_none() && images.references.is_empty() {
            return Err(BottleError::EmptyContent);
        }

        let comment = Comment {
            text,
            images: non_empty(images.references),
            created_at: Utc::now(),
            author_id: requester.id.clone(),
            author_name: requester.display_name.clone(),
            deleted: false,
        };

        let (author_id, kind, position) = {
            let mut index = self.index.lock().await;
            // State may have changed while moderation and downloads ran
            index.check_commentable(requester, id)?;
            let bottle = index.get_mut(id)?;
            bottle.comments.push(comment);
            let position = bottle.comments.len();
            let (author_id, kind) = (bottle.author_id.clone(), bottle.kind());
            self.save_author(&index, &author_id).await?;
            (author_id, kind, position)
        };

        tracing::info!("User {} commented on bottle {}", requester.id, id);
        self.record(&requester.id, ActivityEntry::new(EventKind::Commented, &requester.id, id, kind))
            .await;
        if author_id != requester.id {
            self.record(&author_id, ActivityEntry::new(EventKind::ReceivedComment, &requester.id, id, kind))
                .await;
        }
        Ok(position)
    }

    /// Hide or unhide a bottle. Administrators only.
    pub async fn set_visibility(&self, requester: &Requester, id: BottleId, visible: bool) -> BottleResult<()> {
        if !requester.is_admin {
            return Err(BottleError::Forbidden);
        }

        let (author_id, kind) = {
            let mut index = self.index.lock().await;
            let bottle = index.get_mut(id)?;
            if bottle.visible == visible {
                let state = if visible { "visible" } else { "hidden" };
                return Err(BottleError::AlreadyInState { id, state });
            }
            bottle.visible = visible;
            let (author_id, kind) = (bottle.author_id.clone(), bottle.kind());
            self.save_author(&index, &author_id).await?;
            (author_id, kind)
        };

        let event = if visible { EventKind::Unhidden } else { EventKind::Hidden };
        tracing::info!("Admin {} set bottle {} visible={}", requester.id, id, visible);
        self.record(&author_id, ActivityEntry::new(event, &requester.id, id, kind)).await;
        Ok(())
    }

    /// Soft-delete comments by 1-based index.
    ///
    /// Out-of-range indices are dropped from the outcome; the rest keep their
    /// input order.
    pub async fn delete_comments(
        &self,
        requester: &Requester,
        id: BottleId,
        indices: &[usize],
        author_deletion_allowed: bool,
    ) -> BottleResult<Vec<CommentRemoval>> {
        let (outcomes, removed_authors, kind) = {
            let mut index = self.index.lock().await;
            let bottle = index.get_mut(id)?;
            let is_author = bottle.author_id == requester.id;
            if !requester.is_admin && !(author_deletion_allowed && is_author) {
                return Err(BottleError::Forbidden);
            }

            let mut outcomes = Vec::new();
            let mut removed_authors = Vec::new();
            for &position in indices {
                let slot = position.checked_sub(1).filter(|&i| i < bottle.comments.len());
                let Some(i) = slot else {
                    continue;
                };
                let comment = &mut bottle.comments[i];
                if comment.deleted {
                    outcomes.push(CommentRemoval::AlreadyRemoved(position));
                } else {
                    comment.deleted = true;
                    removed_authors.push(comment.author_id.clone());
                    outcomes.push(CommentRemoval::Removed(position));
                }
            }

            let (author_id, kind) = (bottle.author_id.clone(), bottle.kind());
            if !removed_authors.is_empty() {
                self.save_author(&index, &author_id).await?;
            }
            (outcomes, removed_authors, kind)
        };

        for comment_author in removed_authors {
            self.record(
                &comment_author,
                ActivityEntry::new(EventKind::CommentRemoved, &requester.id, id, kind),
            )
            .await;
        }
        Ok(outcomes)
    }

    /// Retrieval history, most recent last.
    pub async fn history(&self, user_id: &str) -> Vec<HistoryItem> {
        let index = self.index.lock().await;
        index
            .history
            .get(user_id)
            .map(|history| {
                history
                    .ids()
                    .iter()
                    .map(|&id| HistoryItem {
                        id,
                        kind: index.bottles.get(&id).map(Bottle::kind),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every bottle in id order
    pub async fn all_bottles(&self) -> Vec<Bottle> {
        self.index.lock().await.bottles.values().cloned().collect()
    }

    pub async fn authored_by(&self, author_id: &str) -> Vec<Bottle> {
        self.index.lock().await.authored_by(author_id)
    }

    pub async fn summarize(&self, user_id: &str) -> Summary {
        let index = self.index.lock().await;
        stats::summarize(index.bottles.values(), user_id)
    }

    pub async fn last_id(&self) -> BottleId {
        self.index.lock().await.last_id
    }

    /// Count the retrieval and update the requester's history under one lock.
    ///
    /// Returns the bottle after the update and whether this was the
    /// requester's first retrieval of it.
    async fn commit_retrieval(
        &self,
        index: &mut BottleIndex,
        requester: &Requester,
        id: BottleId,
    ) -> BottleResult<(Bottle, bool)> {
        let bottle = index.get_mut(id)?;
        bottle.retrieval_count += 1;
        let snapshot = bottle.clone();

        let history = index.history.entry(requester.id.clone()).or_default();
        let first_time = history.touch(id);
        let history = history.clone();

        self.save_author(index, &snapshot.author_id).await?;
        self.repo.save_history(&requester.id, &history).await?;
        Ok((snapshot, first_time))
    }

    async fn record_retrieval(&self, requester: &Requester, bottle: &Bottle, first_time: bool) {
        let kind = bottle.kind();
        tracing::info!("User {} retrieved bottle {}", requester.id, bottle.id);
        self.record(
            &requester.id,
            ActivityEntry::new(EventKind::Retrieved, &requester.id, bottle.id, kind),
        )
        .await;
        if first_time && bottle.author_id != requester.id {
            self.record(
                &bottle.author_id,
                ActivityEntry::new(EventKind::FirstRetrievedByOther, &requester.id, bottle.id, kind),
            )
            .await;
        }
    }

    async fn save_author(&self, index: &BottleIndex, author_id: &str) -> Result<(), StorageError> {
        self.repo.save_author(author_id, &index.authored_by(author_id)).await
    }

    /// Activity is best effort once the bottle change is committed.
    async fn record(&self, owner_id: &str, entry: ActivityEntry) {
        if let Err(e) = self.activity.record(owner_id, entry).await {
            tracing::warn!("Failed to record activity for {}: {}", owner_id, e);
        }
    }
}

fn non_empty(items: Vec<String>) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, kv, KvStore, SqliteKvStore};
    use crate::media::MediaError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoMedia;

    #[async_trait]
    impl MediaStore for EchoMedia {
        async fn store(&self, remote_url: &str, kind: MediaKind, _hint: Option<&str>) -> Result<String, MediaError> {
            let name = remote_url.rsplit('/').next().unwrap_or_default();
            Ok(format!("file:///media/{}/{}", kind.subdir(), name))
        }
    }

    fn create_test_store() -> (BottleStore, Arc<dyn KvStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = db::create_pool(&temp_dir.path().join("test.db")).unwrap();
        db::run_migrations(&pool).unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(pool));
        (build_store(kv.clone()), kv, temp_dir)
    }

    fn build_store(kv: Arc<dyn KvStore>) -> BottleStore {
        BottleStore::new(
            BottleRepository::new(kv.clone(), "b", "h"),
            Arc::new(EchoMedia),
            Arc::new(ContentModerator::disabled()),
            Arc::new(ActivityLog::new(kv, "log", 50)),
            0,
        )
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() {
        let (store, _kv, _temp) = create_test_store();
        let alice = Requester::new("alice");

        let first = store.create(&alice, Draft::text("one")).await.unwrap();
        let second = store.create(&alice, Draft::text("two")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.kind, BottleKind::TextOnly);
    }

    #[tokio::test]
    async fn create_rejects_empty_drafts() {
        let (store, _kv, _temp) = create_test_store();
        let alice = Requester::new("alice");

        let err = store.create(&alice, Draft::text("  <b></b> ")).await.unwrap_err();
        assert!(matches!(err, BottleError::EmptyContent));
        assert_eq!(store.last_id().await, 0);
    }

    #[tokio::test]
    async fn create_stores_media_locally() {
        let (store, _kv, _temp) = create_test_store();
        let alice = Requester::new("alice");

        let created = store
            .create(&alice, Draft::default().with_images(vec!["https://cdn/p.png".into()]))
            .await
            .unwrap();
        assert_eq!(created.kind, BottleKind::ImageOnly);

        let bottles = store.authored_by("alice").await;
        assert_eq!(
            bottles[0].content.images.as_deref(),
            Some(&["file:///media/image/p.png".to_string()][..])
        );
    }

    #[tokio::test]
    async fn ids_continue_after_reload() {
        let (store, kv, _temp) = create_test_store();
        let alice = Requester::new("alice");
        for text in ["a", "b", "c"] {
            store.create(&alice, Draft::text(text)).await.unwrap();
        }

        let reloaded = build_store(kv);
        let report = reloaded.load(None).await.unwrap();
        assert_eq!(report.max_id, 3);
        let next = reloaded.create(&alice, Draft::text("d")).await.unwrap();
        assert_eq!(next.id, 4);
    }

    #[tokio::test]
    async fn duplicate_ids_across_authors_keep_one_owner() {
        let (store, kv, _temp) = create_test_store();
        store.create(&Requester::new("alice"), Draft::text("mine")).await.unwrap();

        let mut copied: Vec<Bottle> = kv::load_json(kv.as_ref(), &kv::record_key("b", "alice"))
            .await
            .unwrap()
            .unwrap();
        copied[0].author_id = "bob".to_string();
        kv::save_json(kv.as_ref(), &kv::record_key("b", "bob"), &copied).await.unwrap();

        let reloaded = build_store(kv);
        let report = reloaded.load(None).await.unwrap();
        assert_eq!(report.max_id, 1);
        assert_eq!(reloaded.all_bottles().await.len(), 1);
        assert!(reloaded.authored_by("alice").await.is_empty());
        let kept = reloaded.authored_by("bob").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].author_id, "bob");
    }

    #[tokio::test]
    async fn history_lists_kinds_and_missing_ids() {
        let (store, kv, _temp) = create_test_store();
        let alice = Requester::new("alice");
        let bob = Requester::new("bob");
        store.create(&alice, Draft::text("hello")).await.unwrap();
        store.retrieve_random(&bob).await.unwrap();
        kv.set("h/bob", "[1, 99]").await.unwrap();

        let reloaded = build_store(kv);
        reloaded.load(None).await.unwrap();
        let history = reloaded.history("bob").await;
        assert_eq!(
            history,
            vec![
                HistoryItem { id: 1, kind: Some(BottleKind::TextOnly) },
                HistoryItem { id: 99, kind: None },
            ]
        );
    }

    #[tokio::test]
    async fn delete_comments_filters_and_reports() {
        let (store, _kv, _temp) = create_test_store();
        let alice = Requester::new("alice");
        let bob = Requester::new("bob");
        let admin = Requester::admin("root");

        store.create(&alice, Draft::text("hello")).await.unwrap();
        store.retrieve_by_id(&admin, 1).await.unwrap();
        store.retrieve_random(&bob).await.unwrap();
        store.add_comment(&bob, 1, Draft::text("first")).await.unwrap();
        store.add_comment(&bob, 1, Draft::text("second")).await.unwrap();

        let outcomes = store.delete_comments(&admin, 1, &[0, 2, 7, 2], false).await.unwrap();
        assert_eq!(
            outcomes,
            vec![CommentRemoval::Removed(2), CommentRemoval::AlreadyRemoved(2)]
        );

        let err = store.delete_comments(&alice, 1, &[1], false).await.unwrap_err();
        assert!(matches!(err, BottleError::Forbidden));
        let outcomes = store.delete_comments(&alice, 1, &[1], true).await.unwrap();
        assert_eq!(outcomes, vec![CommentRemoval::Removed(1)]);
    }
}
