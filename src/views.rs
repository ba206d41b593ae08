//! Derived views over a task snapshot. Pure functions, recomputed per snapshot.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Utc};

use crate::models::{ApplicationType, Company, Outcome, Phase, Task};

/// How close (in days) a future date must be for a task to count as urgent.
pub const URGENCY_DAYS: i64 = 3;

/// Tasks still in play, soonest first. Dateless tasks go last; ties keep
/// snapshot order.
pub fn active_tasks(tasks: &[Task]) -> Vec<&Task> {
    let mut active: Vec<&Task> = tasks.iter().filter(|t| !t.is_history).collect();
    active.sort_by_key(|t| {
        let nearest = t.nearest_date();
        (nearest.is_none(), nearest)
    });
    active
}

/// One slice of the phase distribution. `phase` is `None` only for the
/// placeholder emitted when there are no active tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBucket {
    pub phase: Option<Phase>,
    pub count: usize,
}

/// Active tasks counted per phase, in phase order. Never empty.
pub fn phase_distribution(tasks: &[Task]) -> Vec<PhaseBucket> {
    let mut counts: BTreeMap<Phase, usize> = BTreeMap::new();
    for task in tasks.iter().filter(|t| !t.is_history) {
        *counts.entry(task.phase).or_default() += 1;
    }
    if counts.is_empty() {
        return vec![PhaseBucket {
            phase: None,
            count: 1,
        }];
    }
    counts
        .into_iter()
        .map(|(phase, count)| PhaseBucket {
            phase: Some(phase),
            count,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeTally {
    pub application_type: ApplicationType,
    pub in_progress: usize,
    pub offer: usize,
    pub rejected: usize,
}

impl OutcomeTally {
    fn empty(application_type: ApplicationType) -> Self {
        Self {
            application_type,
            in_progress: 0,
            offer: 0,
            rejected: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.in_progress + self.offer + self.rejected
    }
}

/// Non-archived tasks split by outcome, one row per application type.
pub fn outcome_tally(tasks: &[Task]) -> Vec<OutcomeTally> {
    let mut rows: Vec<OutcomeTally> = ApplicationType::ALL
        .iter()
        .map(|ty| OutcomeTally::empty(*ty))
        .collect();
    for task in tasks.iter().filter(|t| !t.is_history) {
        let Some(row) = rows
            .iter_mut()
            .find(|r| r.application_type == task.application_type)
        else {
            continue;
        };
        match task.phase.outcome() {
            Outcome::InProgress => row.in_progress += 1,
            Outcome::Offer => row.offer += 1,
            Outcome::Rejected => row.rejected += 1,
        }
    }
    rows
}

/// Nearest date is still ahead and less than [`URGENCY_DAYS`] away.
pub fn is_urgent(task: &Task, now: DateTime<Utc>) -> bool {
    match task.nearest_date() {
        Some(date) => date > now && date - now < TimeDelta::days(URGENCY_DAYS),
        None => false,
    }
}

/// Archived tasks of one company, most recently completed first.
pub fn company_history<'a>(tasks: &'a [Task], company_id: &str) -> Vec<&'a Task> {
    let mut history: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.is_history && t.company_id == company_id)
        .collect();
    history.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    history
}

/// Companies whose name or industry contains `term`, ignoring case.
pub fn search_companies<'a>(companies: &'a [Company], term: &str) -> Vec<&'a Company> {
    let term = term.trim().to_lowercase();
    companies
        .iter()
        .filter(|c| {
            term.is_empty()
                || c.name.to_lowercase().contains(&term)
                || c.industry.to_lowercase().contains(&term)
        })
        .collect()
}

fn local_day<Tz: TimeZone>(task: &Task, tz: &Tz) -> Option<NaiveDate> {
    task.nearest_date().map(|d| d.with_timezone(tz).date_naive())
}

/// Active tasks whose nearest date falls on `day` in `tz`.
pub fn tasks_on_day<'a, Tz: TimeZone>(tasks: &'a [Task], day: NaiveDate, tz: &Tz) -> Vec<&'a Task> {
    active_tasks(tasks)
        .into_iter()
        .filter(|t| local_day(t, tz) == Some(day))
        .collect()
}

/// Active tasks of one month grouped by local day. Days without tasks are
/// omitted.
pub fn month_agenda<'a, Tz: TimeZone>(
    tasks: &'a [Task],
    year: i32,
    month: u32,
    tz: &Tz,
) -> BTreeMap<NaiveDate, Vec<&'a Task>> {
    let mut agenda: BTreeMap<NaiveDate, Vec<&Task>> = BTreeMap::new();
    for task in active_tasks(tasks) {
        if let Some(day) = local_day(task, tz) {
            if day.year() == year && day.month() == month {
                agenda.entry(day).or_default().push(task);
            }
        }
    }
    agenda
}

/// Company names by identity, for labelling.
pub fn company_names(companies: &[Company]) -> HashMap<&str, &str> {
    companies
        .iter()
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect()
}
