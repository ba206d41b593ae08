use tracing::info;

use crate::error::{Error, Result};
use crate::models::fields;
use crate::repo::owned_by;
use crate::store::{Batch, Collection, Store};
use crate::tracker::Tracker;

/// What a cascade delete removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    pub company_id: String,
    pub task_ids: Vec<String>,
}

impl CascadeReport {
    /// Company plus its tasks.
    pub fn records_removed(&self) -> usize {
        1 + self.task_ids.len()
    }
}

impl<S: Store + Clone> Tracker<S> {
    /// Delete a company and every task referencing it in one atomic batch.
    ///
    /// Only tasks visible to the resolving query are included; a task created
    /// between that query and the commit survives. If the commit fails nothing
    /// is removed and the call can be repeated.
    pub async fn delete_company_cascade(&self, company_id: &str) -> Result<CascadeReport> {
        if company_id.is_empty() {
            return Err(Error::Precondition("company has no identity".into()));
        }
        if let Some(doc) = self.store.get(Collection::Companies, company_id).await? {
            let owner = doc.get(fields::USER_ID).and_then(|v| v.as_str());
            if owner != Some(self.owner.as_str()) {
                return Err(Error::not_found(Collection::Companies, company_id));
            }
        }

        let filter = owned_by(&self.owner).and_eq(fields::COMPANY_ID, company_id);
        let task_ids: Vec<String> = self
            .store
            .query(Collection::Tasks, &filter)
            .await?
            .into_iter()
            .map(|doc| doc.id)
            .collect();

        let mut batch = Batch::new();
        batch.delete(Collection::Companies, company_id);
        for id in &task_ids {
            batch.delete(Collection::Tasks, id.as_str());
        }
        self.store.commit(batch).await?;

        info!(company_id, tasks = task_ids.len(), "company deleted with its tasks");
        Ok(CascadeReport {
            company_id: company_id.to_string(),
            task_ids,
        })
    }
}
