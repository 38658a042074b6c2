//! Article, category and job persistence.
//!
//! [`Store`] is the narrow interface the pipeline writes through.
//! [`SnapshotStore`] implements it over an in-memory [`Snapshot`], optionally
//! mirrored to a JSON file after every mutation (see [`json`]).
//!
//! Every mutation runs under one lock and is applied to a copy that only
//! replaces the live state once it has been persisted, so a failed write
//! never leaves memory and disk disagreeing.

pub mod json;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Article, AutoJob, Category, RunRecord};

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new article; an existing slug is a conflict, never an overwrite.
    async fn insert_article(&self, article: Article) -> Result<Article, StoreError>;
    async fn list_articles(&self) -> Result<Vec<Article>, StoreError>;
    /// Article previously imported from `url`, if any.
    async fn find_article_by_source_url(&self, url: &str) -> Result<Option<Article>, StoreError>;

    /// Category by id or (case-insensitive) name.
    async fn find_category(&self, key: &str) -> Result<Option<Category>, StoreError>;
    /// Any one category, for callers that did not pick one.
    async fn any_category(&self) -> Result<Option<Category>, StoreError>;
    /// Category by name, created when missing.
    async fn ensure_category(&self, name: &str) -> Result<Category, StoreError>;

    /// Insert a job; a duplicate trigger key is a conflict.
    async fn create_job(&self, job: AutoJob) -> Result<AutoJob, StoreError>;
    async fn list_jobs(&self) -> Result<Vec<AutoJob>, StoreError>;
    async fn find_job_by_trigger_key(&self, key: &str) -> Result<Option<AutoJob>, StoreError>;
    async fn set_job_active(&self, id: &str, active: bool) -> Result<AutoJob, StoreError>;
    /// Apply one invocation's statistics as a single update.
    async fn record_run(&self, id: &str, run: RunRecord) -> Result<AutoJob, StoreError>;
}

/// Everything the store holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub articles: Vec<Article>,
    pub categories: Vec<Category>,
    pub jobs: Vec<AutoJob>,
}

impl Snapshot {
    fn seed(&mut self, default_category: &str) {
        if self.categories.is_empty() {
            self.categories.push(new_category(default_category));
        }
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut AutoJob, StoreError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("job '{id}'")))
    }
}

fn new_category(name: &str) -> Category {
    Category {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
    }
}

pub struct SnapshotStore {
    state: Mutex<Snapshot>,
    path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Volatile store seeded with `default_category`.
    pub fn in_memory(default_category: &str) -> Self {
        let mut snapshot = Snapshot::default();
        snapshot.seed(default_category);
        Self {
            state: Mutex::new(snapshot),
            path: None,
        }
    }

    /// Store backed by a JSON file, created on first write.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path, default_category: &str) -> Result<Self, StoreError> {
        let mut snapshot = json::load_snapshot(path).await?;
        let fresh = snapshot.categories.is_empty();
        snapshot.seed(default_category);
        if fresh {
            json::write_snapshot(&snapshot, path).await?;
        }
        info!(
            articles = snapshot.articles.len(),
            jobs = snapshot.jobs.len(),
            "Opened store"
        );
        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    /// Run `change` on a copy of the state, persist it, then publish it.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = change(&mut next)?;
        if let Some(path) = &self.path {
            json::write_snapshot(&next, path).await?;
        }
        *state = next;
        Ok(out)
    }

    async fn read<T>(&self, view: impl FnOnce(&Snapshot) -> T) -> T {
        let state = self.state.lock().await;
        view(&state)
    }
}

#[async_trait]
impl Store for SnapshotStore {
    async fn insert_article(&self, article: Article) -> Result<Article, StoreError> {
        self.mutate(|s| {
            if s.articles.iter().any(|a| a.slug == article.slug) {
                return Err(StoreError::Conflict(format!("slug '{}'", article.slug)));
            }
            s.articles.push(article.clone());
            debug!(slug = %article.slug, "Article stored");
            Ok(article)
        })
        .await
    }

    async fn list_articles(&self) -> Result<Vec<Article>, StoreError> {
        Ok(self.read(|s| s.articles.clone()).await)
    }

    async fn find_article_by_source_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        Ok(self
            .read(|s| {
                s.articles
                    .iter()
                    .find(|a| a.source_url.as_deref() == Some(url))
                    .cloned()
            })
            .await)
    }

    async fn find_category(&self, key: &str) -> Result<Option<Category>, StoreError> {
        Ok(self
            .read(|s| {
                s.categories
                    .iter()
                    .find(|c| c.id == key || c.name.eq_ignore_ascii_case(key))
                    .cloned()
            })
            .await)
    }

    async fn any_category(&self) -> Result<Option<Category>, StoreError> {
        Ok(self.read(|s| s.categories.first().cloned()).await)
    }

    async fn ensure_category(&self, name: &str) -> Result<Category, StoreError> {
        self.mutate(|s| {
            if let Some(existing) = s
                .categories
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
            {
                return Ok(existing.clone());
            }
            let category = new_category(name);
            s.categories.push(category.clone());
            info!(name, "Created category");
            Ok(category)
        })
        .await
    }

    async fn create_job(&self, job: AutoJob) -> Result<AutoJob, StoreError> {
        self.mutate(|s| {
            if s.jobs.iter().any(|j| j.trigger_key == job.trigger_key) {
                return Err(StoreError::Conflict("trigger key".to_string()));
            }
            if s.jobs.iter().any(|j| j.id == job.id) {
                return Err(StoreError::Conflict(format!("job id '{}'", job.id)));
            }
            s.jobs.push(job.clone());
            Ok(job)
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<AutoJob>, StoreError> {
        Ok(self.read(|s| s.jobs.clone()).await)
    }

    async fn find_job_by_trigger_key(&self, key: &str) -> Result<Option<AutoJob>, StoreError> {
        Ok(self
            .read(|s| s.jobs.iter().find(|j| j.trigger_key == key).cloned())
            .await)
    }

    async fn set_job_active(&self, id: &str, active: bool) -> Result<AutoJob, StoreError> {
        self.mutate(|s| {
            let job = s.job_mut(id)?;
            job.is_active = active;
            Ok(job.clone())
        })
        .await
    }

    async fn record_run(&self, id: &str, run: RunRecord) -> Result<AutoJob, StoreError> {
        self.mutate(|s| {
            let job = s.job_mut(id)?;
            job.last_run_at = Some(run.at);
            job.last_run_status = run.status;
            job.total_runs += 1;
            job.total_articles_generated += run.articles;
            job.total_duplicates_skipped += run.skipped;
            Ok(job.clone())
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Language, NewsModel, NewsStyle, RunStatus};
    use chrono::Utc;

    fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }

    pub(crate) fn article(slug: &str) -> Article {
        Article {
            id: Uuid::new_v4().to_string(),
            title: "T".into(),
            slug: slug.into(),
            content: "<p>c</p>".into(),
            excerpt: "e".into(),
            featured_image_url: None,
            category_id: "c".into(),
            author_id: None,
            source_url: None,
            source_name: None,
            is_published: false,
            created_at: now(),
            updated_at: now(),
        }
    }

    pub(crate) fn job(key: &str) -> AutoJob {
        AutoJob {
            id: Uuid::new_v4().to_string(),
            name: "Job".into(),
            trigger_key: key.into(),
            theme: "Banjir".into(),
            feed_ids: vec![],
            feed_url: None,
            category_id: None,
            style: NewsStyle::Formal,
            model_type: NewsModel::BreakingNews,
            target_language: Language::Id,
            generate_image: false,
            is_published: false,
            show_source_attribution: false,
            articles_per_run: 1,
            is_active: true,
            last_run_at: None,
            last_run_status: RunStatus::None,
            total_runs: 0,
            total_articles_generated: 0,
            total_duplicates_skipped: 0,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn test_seeded_with_default_category() {
        let store = SnapshotStore::in_memory("Umum");
        let category = store.any_category().await.unwrap().unwrap();
        assert_eq!(category.name, "Umum");
        assert_eq!(
            store.find_category("umum").await.unwrap().map(|c| c.id),
            Some(category.id)
        );
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_conflict() {
        let store = SnapshotStore::in_memory("Umum");
        store.insert_article(article("a-1")).await.unwrap();
        let err = store.insert_article(article("a-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_articles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_run_accumulates() {
        let store = SnapshotStore::in_memory("Umum");
        let created = store.create_job(job("k1")).await.unwrap();
        let run = RunRecord {
            at: now(),
            status: RunStatus::Success,
            articles: 2,
            skipped: 1,
        };
        store.record_run(&created.id, run).await.unwrap();
        let after = store.record_run(&created.id, run).await.unwrap();
        assert_eq!(after.total_runs, 2);
        assert_eq!(after.total_articles_generated, 4);
        assert_eq!(after.total_duplicates_skipped, 2);
        assert_eq!(after.last_run_status, RunStatus::Success);

        let missing = store.record_run("nope", run).await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_lose_updates() {
        let store = std::sync::Arc::new(SnapshotStore::in_memory("Umum"));
        let created = store.create_job(job("k1")).await.unwrap();
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                let id = created.id.clone();
                tokio::spawn(async move {
                    store
                        .record_run(
                            &id,
                            RunRecord {
                                at: now(),
                                status: RunStatus::Success,
                                articles: 1,
                                skipped: 0,
                            },
                        )
                        .await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let job = store.find_job_by_trigger_key("k1").await.unwrap().unwrap();
        assert_eq!(job.total_runs, 20);
        assert_eq!(job.total_articles_generated, 20);
    }

    #[tokio::test]
    async fn test_find_article_by_source_url() {
        let store = SnapshotStore::in_memory("Umum");
        let mut imported = article("a-1");
        imported.source_url = Some("https://tempo.co/a/1".into());
        store.insert_article(imported.clone()).await.unwrap();
        store.insert_article(article("a-2")).await.unwrap();

        let found = store.find_article_by_source_url("https://tempo.co/a/1").await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(imported.id));
        assert!(store.find_article_by_source_url("https://tempo.co/a/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_trigger_key_is_conflict() {
        let store = SnapshotStore::in_memory("Umum");
        store.create_job(job("same")).await.unwrap();
        assert!(matches!(
            store.create_job(job("same")).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }
}
