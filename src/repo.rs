use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    Company, CompanyPatch, CommonText, CommonTextPatch, NewCommonText, NewCompany, NewTask, Task,
    TaskPatch, fields,
};
use crate::sanitize::{Fields, to_fields};
use crate::store::{Collection, Document, Filter, Store};
use crate::watch::Subscription;

/// A record kind the repository knows how to validate and decode.
pub trait Entity: DeserializeOwned + Send + 'static {
    const COLLECTION: Collection;

    /// Record without identity, as handed to `create`.
    type Draft: Serialize + Send + Sync;
    /// Fields an update may replace.
    type Patch: Serialize + Send + Sync;

    fn draft_owner(draft: &Self::Draft) -> &str;

    /// Validate a draft and normalize it for storage.
    fn prepare_draft(draft: Self::Draft) -> Result<Self::Draft>;

    fn check_patch(_patch: &Self::Patch) -> Result<()> {
        Ok(())
    }

    /// Whether this stored record may still be changed.
    fn check_mutable(&self) -> Result<()> {
        Ok(())
    }

    /// Fields every new record starts with, beyond the draft.
    fn seed_fields(_fields: &mut Fields) {}

    fn owner(&self) -> &str;

    fn assign_id(&mut self, id: String);
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn require_if_set(value: Option<&String>, what: &str) -> Result<()> {
    match value {
        Some(v) => require(v, what),
        None => Ok(()),
    }
}

impl Entity for Company {
    const COLLECTION: Collection = Collection::Companies;
    type Draft = NewCompany;
    type Patch = CompanyPatch;

    fn draft_owner(draft: &NewCompany) -> &str {
        &draft.user_id
    }

    fn prepare_draft(draft: NewCompany) -> Result<NewCompany> {
        require(&draft.name, "company name")?;
        Ok(draft)
    }

    fn check_patch(patch: &CompanyPatch) -> Result<()> {
        require_if_set(patch.name.as_ref(), "company name")
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Entity for Task {
    const COLLECTION: Collection = Collection::Tasks;
    type Draft = NewTask;
    type Patch = TaskPatch;

    fn draft_owner(draft: &NewTask) -> &str {
        &draft.user_id
    }

    fn prepare_draft(mut draft: NewTask) -> Result<NewTask> {
        require(&draft.company_id, "task company")?;
        draft.retain_relevant_dates();
        Ok(draft)
    }

    fn check_patch(patch: &TaskPatch) -> Result<()> {
        require_if_set(patch.company_id.as_ref(), "task company")
    }

    fn check_mutable(&self) -> Result<()> {
        if self.is_history {
            return Err(Error::Precondition(format!(
                "task '{}' is archived and cannot change",
                self.id
            )));
        }
        Ok(())
    }

    fn seed_fields(body: &mut Fields) {
        body.insert(fields::IS_HISTORY.to_string(), Value::Bool(false));
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Entity for CommonText {
    const COLLECTION: Collection = Collection::CommonTexts;
    type Draft = NewCommonText;
    type Patch = CommonTextPatch;

    fn draft_owner(draft: &NewCommonText) -> &str {
        &draft.user_id
    }

    fn prepare_draft(draft: NewCommonText) -> Result<NewCommonText> {
        require(&draft.title, "text title")?;
        Ok(draft)
    }

    fn check_patch(patch: &CommonTextPatch) -> Result<()> {
        require_if_set(patch.title.as_ref(), "text title")
    }

    fn owner(&self) -> &str {
        &self.user_id
    }

    fn assign_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Decode a stored document into its entity, identity taken from the key.
pub fn decode_entity<E: Entity>(doc: &Document) -> Result<E> {
    let mut entity: E = doc.decode(E::COLLECTION)?;
    entity.assign_id(doc.id.clone());
    Ok(entity)
}

/// Filter matching every record owned by `owner`.
pub fn owned_by(owner: &str) -> Filter {
    Filter::eq(fields::USER_ID, owner)
}

/// Typed, owner-scoped access to one collection.
pub struct Repository<S, E> {
    store: S,
    owner: String,
    _entity: PhantomData<fn() -> E>,
}

impl<S: Clone, E> Clone for Repository<S, E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            owner: self.owner.clone(),
            _entity: PhantomData,
        }
    }
}

impl<S: Store, E: Entity> Repository<S, E> {
    pub fn new(store: S, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            _entity: PhantomData,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Live owner-scoped snapshots of the collection.
    pub fn subscribe(&self) -> Snapshots<E> {
        Snapshots {
            inner: self.store.subscribe(E::COLLECTION, owned_by(&self.owner)),
            _entity: PhantomData,
        }
    }

    /// Point-in-time list of the owner's records.
    pub async fn list(&self) -> Result<Vec<E>> {
        self.list_where(Filter::all()).await
    }

    /// Point-in-time list of the owner's records matching `filter` as well.
    pub async fn list_where(&self, filter: Filter) -> Result<Vec<E>> {
        let filter = filter.and_eq(fields::USER_ID, self.owner.as_str());
        self.store
            .query(E::COLLECTION, &filter)
            .await?
            .iter()
            .map(decode_entity)
            .collect()
    }

    /// `None` when absent or owned by someone else.
    pub async fn find(&self, id: &str) -> Result<Option<E>> {
        if id.is_empty() {
            return Ok(None);
        }
        let Some(doc) = self.store.get(E::COLLECTION, id).await? else {
            return Ok(None);
        };
        let entity: E = decode_entity(&doc)?;
        Ok((entity.owner() == self.owner).then_some(entity))
    }

    pub async fn get(&self, id: &str) -> Result<E> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::not_found(E::COLLECTION, id))
    }

    pub async fn create(&self, draft: E::Draft) -> Result<String> {
        let owner = E::draft_owner(&draft);
        require(owner, "owner")?;
        if owner != self.owner {
            return Err(Error::Validation(format!(
                "record owner '{owner}' does not match session owner '{}'",
                self.owner
            )));
        }
        let draft = E::prepare_draft(draft)?;
        let mut body = to_fields(&draft)?;
        E::seed_fields(&mut body);

        let id = self.store.insert(E::COLLECTION, body).await?;
        info!(collection = %E::COLLECTION, %id, "created");
        Ok(id)
    }

    pub async fn update(&self, id: &str, patch: E::Patch) -> Result<()> {
        E::check_patch(&patch)?;
        let current = self.get(id).await?;
        current.check_mutable()?;

        let changes = to_fields(&patch)?;
        if changes.is_empty() {
            debug!(collection = %E::COLLECTION, %id, "empty update skipped");
            return Ok(());
        }
        self.store.update(E::COLLECTION, id, changes).await?;
        info!(collection = %E::COLLECTION, %id, "updated");
        Ok(())
    }

    /// Idempotent; records of other owners are left alone.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.find(id).await?.is_none() {
            debug!(collection = %E::COLLECTION, %id, "nothing to delete");
            return Ok(());
        }
        self.store.delete(E::COLLECTION, id).await?;
        info!(collection = %E::COLLECTION, %id, "deleted");
        Ok(())
    }
}

/// Typed view over a [`Subscription`]: every item is the owner's full list.
///
/// Documents that no longer decode are skipped with a warning.
pub struct Snapshots<E> {
    inner: Subscription,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Snapshots<E> {
    pub fn detach(self) {
        self.inner.detach();
    }

    pub async fn next_snapshot(&mut self) -> Option<Vec<E>> {
        self.inner.next_snapshot().await.map(decode_snapshot)
    }
}

fn decode_snapshot<E: Entity>(docs: Vec<Document>) -> Vec<E> {
    docs.iter()
        .filter_map(|doc| match decode_entity(doc) {
            Ok(entity) => Some(entity),
            Err(err) => {
                warn!(error = %err, "skipping malformed document");
                None
            }
        })
        .collect()
}

impl<E: Entity> Stream for Snapshots<E> {
    type Item = Vec<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|snapshot| snapshot.map(decode_snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Phase, Priority};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use serde_json::json;

    fn companies(store: &MemoryStore, owner: &str) -> Repository<MemoryStore, Company> {
        Repository::new(store.clone(), owner)
    }

    fn tasks(store: &MemoryStore, owner: &str) -> Repository<MemoryStore, Task> {
        Repository::new(store.clone(), owner)
    }

    #[tokio::test]
    async fn create_assigns_identity_outside_the_body() {
        let store = MemoryStore::new();
        let repo = companies(&store, "u1");
        let id = repo.create(NewCompany::new("u1", "Acme")).await.unwrap();

        let doc = store.get(Collection::Companies, &id).await.unwrap().unwrap();
        assert!(doc.get("id").is_none());
        assert_eq!(doc.get("userId"), Some(&json!("u1")));

        let company = repo.get(&id).await.unwrap();
        assert_eq!(company.id, id);
        assert_eq!(company.name, "Acme");
        assert_eq!(company.priority, Priority::First);
    }

    #[tokio::test]
    async fn create_requires_owner_and_label() {
        let store = MemoryStore::new();
        let repo = companies(&store, "u1");

        let err = repo.create(NewCompany::new("u1", "  ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = repo.create(NewCompany::new("", "Acme")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = repo.create(NewCompany::new("u2", "Acme")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let texts: Repository<MemoryStore, CommonText> = Repository::new(store.clone(), "u1");
        let err = texts.create(NewCommonText::new("u1", "")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.count(Collection::Companies), 0);
        assert_eq!(store.count(Collection::CommonTexts), 0);
    }

    #[tokio::test]
    async fn new_tasks_start_active_with_relevant_dates_only() {
        let store = MemoryStore::new();
        let repo = tasks(&store, "u1");
        let mut draft = NewTask::new("u1", "c1", "Acme");
        draft.phase = Phase::Interview;
        draft.deadline = Some(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());
        draft.event_date = Some(Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).unwrap());

        let id = repo.create(draft).await.unwrap();
        let doc = store.get(Collection::Tasks, &id).await.unwrap().unwrap();
        assert_eq!(doc.get("isHistory"), Some(&json!(false)));
        assert!(doc.get("deadline").is_none());
        assert!(doc.get("eventDate").is_some());

        let err = repo.create(NewTask::new("u1", "", "Acme")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn update_replaces_given_fields() {
        let store = MemoryStore::new();
        let repo = companies(&store, "u1");
        let id = repo.create(NewCompany::new("u1", "Acme")).await.unwrap();

        repo.update(
            &id,
            CompanyPatch {
                industry: Some("Trading".into()),
                priority: Some(Priority::Second),
                ..CompanyPatch::default()
            },
        )
        .await
        .unwrap();

        let company = repo.get(&id).await.unwrap();
        assert_eq!(company.name, "Acme");
        assert_eq!(company.industry, "Trading");
        assert_eq!(company.priority, Priority::Second);
    }

    #[tokio::test]
    async fn update_rejects_missing_and_foreign_records() {
        let store = MemoryStore::new();
        let mine = companies(&store, "u1");
        let theirs = companies(&store, "u2");
        let id = mine.create(NewCompany::new("u1", "Acme")).await.unwrap();

        let rename = CompanyPatch {
            name: Some("Hijacked".into()),
            ..CompanyPatch::default()
        };
        let err = theirs.update(&id, rename.clone()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        let err = mine.update("missing", rename).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(mine.get(&id).await.unwrap().name, "Acme");

        let blank = CompanyPatch {
            name: Some(String::new()),
            ..CompanyPatch::default()
        };
        assert!(matches!(mine.update(&id, blank).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn archived_tasks_are_immutable() {
        let store = MemoryStore::new();
        let repo = tasks(&store, "u1");
        let id = repo.create(NewTask::new("u1", "c1", "Acme")).await.unwrap();
        let mut archive = Fields::new();
        archive.insert("isHistory".into(), json!(true));
        store.update(Collection::Tasks, &id, archive).await.unwrap();

        let err = repo
            .update(
                &id,
                TaskPatch {
                    note: Some("rewrite history".into()),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_owner_scoped() {
        let store = MemoryStore::new();
        let mine = companies(&store, "u1");
        let theirs = companies(&store, "u2");
        let id = mine.create(NewCompany::new("u1", "Acme")).await.unwrap();

        theirs.delete(&id).await.unwrap();
        assert!(mine.find(&id).await.unwrap().is_some());

        mine.delete(&id).await.unwrap();
        mine.delete(&id).await.unwrap();
        assert!(mine.find(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_subscribe_are_owner_scoped() {
        let store = MemoryStore::new();
        let mine = companies(&store, "u1");
        let theirs = companies(&store, "u2");
        mine.create(NewCompany::new("u1", "Acme")).await.unwrap();
        theirs.create(NewCompany::new("u2", "Globex")).await.unwrap();

        let listed = mine.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Acme");

        let mut feed = mine.subscribe();
        let snapshot = feed.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        mine.create(NewCompany::new("u1", "Initech")).await.unwrap();
        let snapshot = feed.next().await.unwrap();
        let names: Vec<&str> = snapshot.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Acme", "Initech"]);
        feed.detach();
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped_in_snapshots() {
        let store = MemoryStore::new();
        let repo = companies(&store, "u1");
        repo.create(NewCompany::new("u1", "Acme")).await.unwrap();
        let mut broken = Fields::new();
        broken.insert("userId".into(), json!("u1"));
        store.insert(Collection::Companies, broken).await.unwrap();

        let mut feed = repo.subscribe();
        assert_eq!(feed.next_snapshot().await.unwrap().len(), 1);
        assert!(repo.list().await.is_err());
    }
}
