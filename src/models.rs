use std::fmt;
use std::str::FromStr;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::Error;

/// Body field names shared by queries and operators.
pub mod fields {
    pub const USER_ID: &str = "userId";
    pub const COMPANY_ID: &str = "companyId";
    pub const IS_HISTORY: &str = "isHistory";
    pub const COMPLETED_AT: &str = "completedAt";
}

macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    _ => {
                        let valid: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                        Err(Error::Validation(format!(
                            "invalid {} '{s}': must be one of {}",
                            $what,
                            valid.join(", ")
                        )))
                    }
                }
            }
        }
    };
}

/// Preference band of a company, first being the most wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    First,
    Second,
    Third,
}

string_enum!(Priority, "priority", {
    First => "first",
    Second => "second",
    Third => "third",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Selection,
    Internship,
    Event,
}

string_enum!(ApplicationType, "application type", {
    Selection => "selection",
    Internship => "internship",
    Event => "event",
});

/// Selection stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DocumentScreening,
    AptitudeTest,
    GroupDiscussion,
    Interview,
    FinalInterview,
    Other,
    Offer,
    Rejected,
    ParticipationConfirmed,
}

string_enum!(Phase, "phase", {
    DocumentScreening => "document_screening",
    AptitudeTest => "aptitude_test",
    GroupDiscussion => "group_discussion",
    Interview => "interview",
    FinalInterview => "final_interview",
    Other => "other",
    Offer => "offer",
    Rejected => "rejected",
    ParticipationConfirmed => "participation_confirmed",
});

/// Which date fields carry meaning for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateKind {
    /// `deadline`
    Deadline,
    /// `eventDate`, `eventEndDate`, `startTime`, `endTime`
    Event,
    None,
}

/// How a phase counts in the outcome tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    InProgress,
    Offer,
    Rejected,
}

impl Phase {
    pub fn date_kind(self) -> DateKind {
        match self {
            Self::DocumentScreening | Self::AptitudeTest => DateKind::Deadline,
            Self::GroupDiscussion
            | Self::Interview
            | Self::FinalInterview
            | Self::Other
            | Self::ParticipationConfirmed => DateKind::Event,
            Self::Offer | Self::Rejected => DateKind::None,
        }
    }

    pub fn outcome(self) -> Outcome {
        match self {
            Self::Offer | Self::ParticipationConfirmed => Outcome::Offer,
            Self::Rejected => Outcome::Rejected,
            _ => Outcome::InProgress,
        }
    }

    /// Terminal for any application type.
    pub fn is_terminal(self) -> bool {
        self.outcome() != Outcome::InProgress
    }

    /// Terminal for the given application type: offer/rejected end a selection
    /// or internship, participation-confirmed ends an event.
    pub fn is_terminal_for(self, application_type: ApplicationType) -> bool {
        match application_type {
            ApplicationType::Selection | ApplicationType::Internship => {
                matches!(self, Self::Offer | Self::Rejected)
            }
            ApplicationType::Event => self == Self::ParticipationConfirmed,
        }
    }
}

/// `HH:MM` wall-clock times, stored as strings.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => s.serialize_str(&t.format(FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.filter(|s| !s.is_empty())
            .map(|s| NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Parse an `HH:MM` time.
pub fn parse_time(s: &str) -> Result<NaiveTime, Error> {
    NaiveTime::parse_from_str(s, hhmm::FORMAT)
        .map_err(|_| Error::Validation(format!("invalid time '{s}': expected HH:MM")))
}

// --- Company ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    #[serde(skip)]
    pub id: String, // document key, never part of the body
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub industry: String,
    pub priority: Priority,
    #[serde(default)]
    pub mypage_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCompany {
    pub user_id: String,
    pub name: String,
    pub industry: String,
    pub priority: Priority,
    pub mypage_id: String,
    pub url: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl NewCompany {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            industry: String::new(),
            priority: Priority::First,
            mypage_id: String::new(),
            url: String::new(),
            created_at: SystemClock.now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mypage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// --- Task ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsQuestion {
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(skip)]
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub company_name: String, // snapshot taken at creation
    #[serde(rename = "type")]
    pub application_type: ApplicationType,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub es_questions: Vec<EsQuestion>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub is_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Earliest of deadline, event date and event end date.
    pub fn nearest_date(&self) -> Option<DateTime<Utc>> {
        [self.deadline, self.event_date, self.event_end_date]
            .into_iter()
            .flatten()
            .min()
    }

    /// Every field except identity and the archive markers.
    pub fn to_draft(&self) -> NewTask {
        NewTask {
            user_id: self.user_id.clone(),
            company_id: self.company_id.clone(),
            company_name: self.company_name.clone(),
            application_type: self.application_type,
            phase: self.phase,
            deadline: self.deadline,
            event_date: self.event_date,
            event_end_date: self.event_end_date,
            start_time: self.start_time,
            end_time: self.end_time,
            es_questions: self.es_questions.clone(),
            note: self.note.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub user_id: String,
    pub company_id: String,
    pub company_name: String,
    #[serde(rename = "type")]
    pub application_type: ApplicationType,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub end_time: Option<NaiveTime>,
    pub es_questions: Vec<EsQuestion>,
    pub note: String,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        user_id: impl Into<String>,
        company_id: impl Into<String>,
        company_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            company_id: company_id.into(),
            company_name: company_name.into(),
            application_type: ApplicationType::Selection,
            phase: Phase::DocumentScreening,
            deadline: None,
            event_date: None,
            event_end_date: None,
            start_time: None,
            end_time: None,
            es_questions: Vec::new(),
            note: String::new(),
            created_at: SystemClock.now(),
        }
    }

    /// Drop date fields the current phase gives no meaning to.
    pub fn retain_relevant_dates(&mut self) {
        let kind = self.phase.date_kind();
        if kind != DateKind::Deadline {
            self.deadline = None;
        }
        if kind != DateKind::Event {
            self.event_date = None;
            self.event_end_date = None;
            self.start_time = None;
            self.end_time = None;
        }
    }
}

/// Partial task update, also used as the override set for progression.
///
/// Ownership and archive markers are deliberately absent: they change only
/// through progression.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub application_type: Option<ApplicationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "ts_milliseconds_option")]
    pub event_end_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none", with = "hhmm")]
    pub end_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_questions: Option<Vec<EsQuestion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// --- Common texts ---

/// Nominal target length of a self-introduction variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextLength {
    Short,
    Medium,
    Long,
}

impl TextLength {
    pub const ALL: [TextLength; 3] = [Self::Short, Self::Medium, Self::Long];

    pub fn chars(self) -> usize {
        match self {
            Self::Short => 300,
            Self::Medium => 400,
            Self::Long => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonText {
    #[serde(skip)]
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default, rename = "text300")]
    pub text_300: String,
    #[serde(default, rename = "text400")]
    pub text_400: String,
    #[serde(default, rename = "text500")]
    pub text_500: String,
}

impl CommonText {
    pub fn text(&self, length: TextLength) -> &str {
        match length {
            TextLength::Short => &self.text_300,
            TextLength::Medium => &self.text_400,
            TextLength::Long => &self.text_500,
        }
    }

    /// Characters written so far; the target is advisory, never enforced.
    pub fn char_count(&self, length: TextLength) -> usize {
        self.text(length).chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommonText {
    pub user_id: String,
    pub title: String,
    #[serde(rename = "text300")]
    pub text_300: String,
    #[serde(rename = "text400")]
    pub text_400: String,
    #[serde(rename = "text500")]
    pub text_500: String,
}

impl NewCommonText {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            text_300: String::new(),
            text_400: String::new(),
            text_500: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommonTextPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "text300", skip_serializing_if = "Option::is_none")]
    pub text_300: Option<String>,
    #[serde(rename = "text400", skip_serializing_if = "Option::is_none")]
    pub text_400: Option<String>,
    #[serde(rename = "text500", skip_serializing_if = "Option::is_none")]
    pub text_500: Option<String>,
}
