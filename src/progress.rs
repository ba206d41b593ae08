//! Moving a task to its next selection phase.
//!
//! Progression never edits a task in place. The current record is archived
//! (`isHistory = true`, `completedAt` stamped) and a successor is inserted at
//! the new phase, both in one atomic batch, so an archived task always has a
//! successor and a successor always has an archived predecessor.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::{NewTask, Phase, Task, TaskPatch, fields};
use crate::repo::Entity;
use crate::sanitize::{Fields, to_fields};
use crate::store::{Batch, Collection, Store};
use crate::tracker::Tracker;

/// Identities involved in a completed progression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progression {
    pub archived_id: String,
    pub successor_id: String,
}

/// Advisory next phase. Callers are free to pick any other.
pub fn suggest_next_phase(current: Phase) -> Phase {
    match current {
        Phase::DocumentScreening => Phase::AptitudeTest,
        _ => Phase::Interview,
    }
}

/// Override set to present before the user confirms a progression: the
/// suggested phase, no dates, and the current questions carried forward
/// explicitly.
pub fn suggested_overrides(current: &Task) -> TaskPatch {
    TaskPatch {
        phase: Some(suggest_next_phase(current.phase)),
        es_questions: Some(current.es_questions.clone()),
        ..TaskPatch::default()
    }
}

/// The record that replaces `current`.
///
/// Identity-free fields come from `current` unless overridden. Date and time
/// fields come only from `overrides`; when it leaves one unset the successor
/// has none. Note and questions default to empty.
pub fn successor_draft(current: &Task, overrides: &TaskPatch, now: DateTime<Utc>) -> NewTask {
    let base = current.to_draft();
    let overrides = overrides.clone();
    NewTask {
        user_id: base.user_id,
        company_id: overrides.company_id.unwrap_or(base.company_id),
        company_name: overrides.company_name.unwrap_or(base.company_name),
        application_type: overrides.application_type.unwrap_or(base.application_type),
        phase: overrides.phase.unwrap_or(base.phase),
        deadline: overrides.deadline,
        event_date: overrides.event_date,
        event_end_date: overrides.event_end_date,
        start_time: overrides.start_time,
        end_time: overrides.end_time,
        es_questions: overrides.es_questions.unwrap_or_default(),
        note: overrides.note.unwrap_or_default(),
        created_at: now,
    }
}

fn archive_fields(now: DateTime<Utc>) -> Fields {
    let mut archived = Fields::new();
    archived.insert(fields::IS_HISTORY.to_string(), Value::Bool(true));
    archived.insert(
        fields::COMPLETED_AT.to_string(),
        Value::from(now.timestamp_millis()),
    );
    archived
}

impl<S: Store + Clone> Tracker<S> {
    /// Archive `current` and create its successor with `overrides` applied.
    ///
    /// Only the identity of `current` is trusted; every carried field is read
    /// back from the owner's stored record. Succeeds only once both writes are durable; on any failure neither is
    /// visible.
    pub async fn progress_task(&self, current: &Task, overrides: TaskPatch) -> Result<Progression> {
        if current.id.is_empty() {
            return Err(Error::Precondition("task has no identity".into()));
        }
        Task::check_patch(&overrides)?;

        // The stored record, not the caller's copy, is what gets carried forward.
        let stored = self.tasks().get(&current.id).await?;
        stored.check_mutable()?;

        let now = self.clock.now();
        let successor = successor_draft(&stored, &overrides, now);
        let mut successor_fields = to_fields(&successor)?;
        Task::seed_fields(&mut successor_fields);

        let mut batch = Batch::new();
        batch
            .update(Collection::Tasks, stored.id.as_str(), archive_fields(now))
            .insert(Collection::Tasks, successor_fields);
        let assigned = self.store.commit(batch).await?;
        let successor_id = assigned
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transaction("commit assigned no successor identity".into()))?;

        info!(
            archived = %current.id,
            successor = %successor_id,
            phase = %successor.phase,
            "task progressed"
        );
        Ok(Progression {
            archived_id: current.id.clone(),
            successor_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::SqliteStore;
    use crate::models::{ApplicationType, EsQuestion, NewCompany, parse_time};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap()
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, d, 23, 59, 0).unwrap()
    }

    async fn screening_task<S: Store + Clone>(tracker: &Tracker<S>) -> Task {
        let company = tracker
            .companies()
            .create(NewCompany::new("u1", "Acme"))
            .await
            .unwrap();
        let mut draft = NewTask::new("u1", company, "");
        draft.deadline = Some(day(5));
        draft.note = "bring transcript".to_string();
        draft.es_questions = vec![EsQuestion {
            question: "Why us?".into(),
            answer: "Because.".into(),
        }];
        let id = tracker.add_task(draft).await.unwrap();
        tracker.tasks().get(&id).await.unwrap()
    }

    #[test]
    fn suggestions() {
        assert_eq!(suggest_next_phase(Phase::DocumentScreening), Phase::AptitudeTest);
        assert_eq!(suggest_next_phase(Phase::AptitudeTest), Phase::Interview);
        assert_eq!(suggest_next_phase(Phase::GroupDiscussion), Phase::Interview);
        assert_eq!(suggest_next_phase(Phase::FinalInterview), Phase::Interview);
    }

    #[tokio::test]
    async fn screening_to_aptitude_test() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1").with_clock(FixedClock(now()));
        let current = screening_task(&tracker).await;

        let overrides = TaskPatch {
            phase: Some(Phase::AptitudeTest),
            deadline: Some(day(12)),
            ..TaskPatch::default()
        };
        let done = tracker.progress_task(&current, overrides).await.unwrap();
        assert_eq!(done.archived_id, current.id);

        let archived = tracker.tasks().get(&current.id).await.unwrap();
        assert!(archived.is_history);
        assert_eq!(archived.completed_at, Some(now()));
        assert_eq!(archived.phase, Phase::DocumentScreening);
        assert_eq!(archived.deadline, Some(day(5)));

        let next = tracker.tasks().get(&done.successor_id).await.unwrap();
        assert_eq!(next.phase, Phase::AptitudeTest);
        assert_eq!(next.deadline, Some(day(12)));
        assert_eq!(next.event_date, None);
        assert!(!next.is_history);
        assert_eq!(next.completed_at, None);
        assert!(next.es_questions.is_empty());
        assert_eq!(next.note, "");
        assert_eq!(next.created_at, now());
        assert_eq!(next.company_id, current.company_id);
        assert_eq!(next.company_name, "Acme");

        assert_eq!(store.count(Collection::Tasks), 2);
    }

    #[tokio::test]
    async fn dates_never_carry_over() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1").with_clock(FixedClock(now()));
        let mut current = screening_task(&tracker).await;
        current.start_time = Some(parse_time("10:00").unwrap());

        let done = tracker
            .progress_task(
                &current,
                TaskPatch {
                    phase: Some(Phase::Interview),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();

        let doc = store
            .get(Collection::Tasks, &done.successor_id)
            .await
            .unwrap()
            .unwrap();
        for field in ["deadline", "eventDate", "eventEndDate", "startTime", "endTime", "completedAt", "id"] {
            assert!(doc.get(field).is_none(), "{field} should be absent");
        }
    }

    #[tokio::test]
    async fn overrides_replace_fields() {
        let tracker = Tracker::new(MemoryStore::new(), "u1").with_clock(FixedClock(now()));
        let current = screening_task(&tracker).await;
        let overrides = TaskPatch {
            application_type: Some(ApplicationType::Internship),
            phase: Some(Phase::GroupDiscussion),
            event_date: Some(day(20)),
            start_time: Some(parse_time("13:00").unwrap()),
            end_time: Some(parse_time("15:30").unwrap()),
            es_questions: Some(current.es_questions.clone()),
            note: Some("group of six".into()),
            ..TaskPatch::default()
        };

        let done = tracker.progress_task(&current, overrides).await.unwrap();
        let next = tracker.tasks().get(&done.successor_id).await.unwrap();
        assert_eq!(next.application_type, ApplicationType::Internship);
        assert_eq!(next.phase, Phase::GroupDiscussion);
        assert_eq!(next.event_date, Some(day(20)));
        assert_eq!(next.deadline, None);
        assert_eq!(next.start_time, parse_time("13:00").ok());
        assert_eq!(next.es_questions, current.es_questions);
        assert_eq!(next.note, "group of six");
    }

    #[tokio::test]
    async fn suggested_overrides_carry_questions_only() {
        let tracker = Tracker::new(MemoryStore::new(), "u1");
        let current = screening_task(&tracker).await;
        let seed = suggested_overrides(&current);
        assert_eq!(seed.phase, Some(Phase::AptitudeTest));
        assert_eq!(seed.es_questions.as_deref(), Some(current.es_questions.as_slice()));
        assert_eq!(seed.deadline, None);
        assert_eq!(seed.note, None);
    }

    #[tokio::test]
    async fn failed_commit_archives_nothing() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1");
        let current = screening_task(&tracker).await;

        store.fail_next_commits(1);
        let err = tracker
            .progress_task(&current, suggested_overrides(&current))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transaction(_)));

        let tasks = tracker.tasks().list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].is_history);
        assert_eq!(tasks[0].completed_at, None);
    }

    #[tokio::test]
    async fn missing_identity_fails_before_writing() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1");
        let mut current = screening_task(&tracker).await;
        current.id.clear();

        let err = tracker
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(store.count(Collection::Tasks), 1);
    }

    #[tokio::test]
    async fn deleted_or_foreign_source_is_not_found() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1");
        let current = screening_task(&tracker).await;

        let stranger = Tracker::new(store.clone(), "u2");
        let err = stranger
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        tracker.tasks().delete(&current.id).await.unwrap();
        let err = tracker
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(store.count(Collection::Tasks), 0);
    }

    #[tokio::test]
    async fn successor_stays_with_the_session_owner() {
        let store = MemoryStore::new();
        let tracker = Tracker::new(store.clone(), "u1").with_clock(FixedClock(now()));
        let mut current = screening_task(&tracker).await;
        current.user_id = "u2".into();
        current.company_name = "Stale Inc".into();

        let done = tracker
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap();

        let doc = store
            .get(Collection::Tasks, &done.successor_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.get("userId"), Some(&serde_json::json!("u1")));
        assert_eq!(doc.get("companyName"), Some(&serde_json::json!("Acme")));
        assert_eq!(tracker.tasks().list().await.unwrap().len(), 2);
        assert!(Tracker::new(store.clone(), "u2").tasks().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archived_source_cannot_progress_twice() {
        let tracker = Tracker::new(MemoryStore::new(), "u1");
        let current = screening_task(&tracker).await;
        tracker
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap();

        let err = tracker
            .progress_task(&current, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(tracker.tasks().list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn works_against_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tracker = Tracker::new(store.clone(), "u1").with_clock(FixedClock(now()));
        let current = screening_task(&tracker).await;

        let done = tracker
            .progress_task(&current, suggested_overrides(&current))
            .await
            .unwrap();
        let tasks = tracker.tasks().list().await.unwrap();
        assert_eq!(tasks.len(), 2);
        let next = tasks.iter().find(|t| t.id == done.successor_id).unwrap();
        assert_eq!(next.phase, Phase::AptitudeTest);
        assert_eq!(next.es_questions.len(), 1);
    }
}
