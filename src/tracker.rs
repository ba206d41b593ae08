use std::sync::Arc;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::models::{Company, CommonText, NewTask, Task};
use crate::repo::Repository;
use crate::store::Store;

/// Company name snapshot used when the referenced company cannot be found.
pub const UNKNOWN_COMPANY: &str = "Unknown";

/// One user's view of the store: repositories and the multi-record operators,
/// all scoped to `owner`.
pub struct Tracker<S> {
    pub(crate) store: S,
    pub(crate) owner: String,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<S: Store + Clone> Tracker<S> {
    pub fn new(store: S, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn companies(&self) -> Repository<S, Company> {
        Repository::new(self.store.clone(), self.owner.clone())
    }

    pub fn tasks(&self) -> Repository<S, Task> {
        Repository::new(self.store.clone(), self.owner.clone())
    }

    pub fn texts(&self) -> Repository<S, CommonText> {
        Repository::new(self.store.clone(), self.owner.clone())
    }

    /// Create a task, snapshotting the company's current name into it.
    ///
    /// The snapshot is not refreshed when the company is renamed later.
    pub async fn add_task(&self, mut draft: NewTask) -> Result<String> {
        draft.company_name = match self.companies().find(&draft.company_id).await? {
            Some(company) => company.name,
            None => {
                debug!(company_id = %draft.company_id, "company not found for task snapshot");
                UNKNOWN_COMPANY.to_string()
            }
        };
        draft.created_at = self.clock.now();
        self.tasks().create(draft).await
    }
}
