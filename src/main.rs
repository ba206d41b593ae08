use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use jobtrail::clock::{Clock, SystemClock};
use jobtrail::config::{Config, DB_ENV, LOG_ENV, USER_ENV};
use jobtrail::db::SqliteStore;
use jobtrail::models::{
    ApplicationType, CommonTextPatch, CompanyPatch, EsQuestion, NewCommonText, NewCompany,
    NewTask, Phase, Priority, TaskPatch, TextLength, parse_time,
};
use jobtrail::models::{CommonText, Company, Task};
use jobtrail::progress::suggested_overrides;
use jobtrail::views;
use jobtrail::Tracker;

#[derive(Parser)]
#[command(name = "jobtrail")]
#[command(about = "Track companies, application stages and self-introduction texts")]
struct Cli {
    /// Database file
    #[arg(long, global = true, env = DB_ENV)]
    db: Option<PathBuf>,

    /// Owner identity all records are scoped to
    #[arg(long, global = true, env = USER_ENV)]
    user: Option<String>,

    /// Log filter (tracing directives)
    #[arg(long, global = true, env = LOG_ENV, hide = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage companies
    Company {
        #[command(subcommand)]
        command: CompanyCommands,
    },

    /// Manage application tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Manage self-introduction texts
    Text {
        #[command(subcommand)]
        command: TextCommands,
    },

    /// Phase distribution and outcomes per application type
    Stats,

    /// Active tasks of a month, by day
    Calendar {
        /// Month as YYYY-MM (default: current month)
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Print the active task list again whenever it changes
    Watch,
}

#[derive(Subcommand)]
enum CompanyCommands {
    /// Add a company
    Add {
        name: String,

        #[arg(short, long)]
        industry: Option<String>,

        /// Priority (first, second, third)
        #[arg(short, long, default_value = "first")]
        priority: Priority,

        /// Login id for the company's applicant portal
        #[arg(long)]
        mypage_id: Option<String>,

        #[arg(long)]
        url: Option<String>,
    },

    /// List companies
    List {
        /// Only names or industries containing this term
        #[arg(short, long)]
        search: Option<String>,
    },

    /// Show a company and its task history
    Show {
        /// Company ID (a unique prefix is enough)
        id: String,
    },

    /// Edit a company
    Edit {
        id: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        industry: Option<String>,

        #[arg(short, long)]
        priority: Option<Priority>,

        #[arg(long)]
        mypage_id: Option<String>,

        #[arg(long)]
        url: Option<String>,
    },

    /// Delete a company together with all of its tasks
    Delete {
        id: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct TaskFields {
    /// Application type (selection, internship, event)
    #[arg(long = "type")]
    application_type: Option<ApplicationType>,

    #[arg(long)]
    phase: Option<Phase>,

    /// Deadline, YYYY-MM-DD or "YYYY-MM-DD HH:MM" local time
    #[arg(long, value_parser = parse_when)]
    deadline: Option<DateTime<Utc>>,

    #[arg(long, value_parser = parse_when)]
    event_date: Option<DateTime<Utc>>,

    #[arg(long, value_parser = parse_when)]
    event_end_date: Option<DateTime<Utc>>,

    /// Start time, HH:MM
    #[arg(long, value_parser = parse_time)]
    start: Option<NaiveTime>,

    /// End time, HH:MM
    #[arg(long, value_parser = parse_time)]
    end: Option<NaiveTime>,

    #[arg(long)]
    note: Option<String>,
}

impl TaskFields {
    fn apply_to(self, patch: &mut TaskPatch) {
        if self.application_type.is_some() {
            patch.application_type = self.application_type;
        }
        if self.phase.is_some() {
            patch.phase = self.phase;
        }
        patch.deadline = self.deadline.or(patch.deadline);
        patch.event_date = self.event_date.or(patch.event_date);
        patch.event_end_date = self.event_end_date.or(patch.event_end_date);
        patch.start_time = self.start.or(patch.start_time);
        patch.end_time = self.end.or(patch.end_time);
        if self.note.is_some() {
            patch.note = self.note;
        }
    }

    fn fill_draft(self, draft: &mut NewTask) {
        draft.application_type = self.application_type.unwrap_or(draft.application_type);
        draft.phase = self.phase.unwrap_or(draft.phase);
        draft.deadline = self.deadline;
        draft.event_date = self.event_date;
        draft.event_end_date = self.event_end_date;
        draft.start_time = self.start;
        draft.end_time = self.end;
        draft.note = self.note.unwrap_or_default();
    }
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task for a company
    Add {
        /// Company ID (a unique prefix is enough)
        company: String,

        #[command(flatten)]
        fields: TaskFields,
    },

    /// List active tasks, soonest first
    List {
        /// Include archived stages
        #[arg(short, long)]
        all: bool,
    },

    /// Show task details
    Show { id: String },

    /// Edit an active task
    Edit {
        id: String,

        #[command(flatten)]
        fields: TaskFields,
    },

    /// Append an entry-sheet question
    Question {
        id: String,

        question: String,

        #[arg(short, long, default_value = "")]
        answer: String,
    },

    /// Archive a task and open its next stage
    Progress {
        id: String,

        #[command(flatten)]
        fields: TaskFields,

        /// Do not carry entry-sheet questions over
        #[arg(long)]
        drop_questions: bool,
    },

    /// Delete a task
    Delete {
        id: String,

        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TextCommands {
    /// Add a self-introduction text
    Add {
        title: String,

        #[arg(long)]
        short: Option<String>,

        #[arg(long)]
        medium: Option<String>,

        #[arg(long)]
        long: Option<String>,
    },

    /// List texts
    List,

    /// Show all variants of a text
    Show { id: String },

    /// Edit a text
    Edit {
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        /// Around 300 characters
        #[arg(long)]
        short: Option<String>,

        /// Around 400 characters
        #[arg(long)]
        medium: Option<String>,

        /// Around 500 characters
        #[arg(long)]
        long: Option<String>,
    },

    /// Delete a text
    Delete {
        id: String,

        #[arg(long)]
        yes: bool,
    },
}

fn parse_when(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    let naive = match NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
    {
        Ok(dt) => dt,
        Err(_) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD [HH:MM]"))?
            .and_hms_opt(23, 59, 0)
            .ok_or_else(|| anyhow!("invalid date '{s}'"))?,
    };
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("'{s}' does not exist in the local time zone"))
}

fn parse_month(s: &str) -> Result<(i32, u32)> {
    let first = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
        .with_context(|| format!("invalid month '{s}', expected YYYY-MM"))?;
    Ok((first.year(), first.month()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn local(dt: DateTime<Utc>) -> String {
    dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Resolve a full id or unique id prefix against already-loaded records.
fn pick<'a, T>(items: &'a [T], prefix: &str, id_of: impl Fn(&T) -> &str) -> Result<&'a T> {
    if let Some(exact) = items.iter().find(|item| id_of(item) == prefix) {
        return Ok(exact);
    }
    let mut matches = items.iter().filter(|item| id_of(item).starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(item), None) if !prefix.is_empty() => Ok(item),
        (Some(_), Some(_)) => bail!("id '{prefix}' is ambiguous, give more characters"),
        _ => bail!("no record with id '{prefix}'"),
    }
}

fn require_yes(yes: bool, what: &str) -> Result<()> {
    if !yes {
        bail!("refusing to delete {what} without --yes");
    }
    Ok(())
}

fn print_tasks(tasks: &[&Task], now: DateTime<Utc>) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    println!(
        "{:<2} {:<9} {:<24} {:<12} {:<22} {:<16}",
        "", "ID", "COMPANY", "TYPE", "PHASE", "NEXT DATE"
    );
    println!("{}", "-".repeat(88));
    for task in tasks {
        let marker = if views::is_urgent(task, now) {
            "!"
        } else if task.is_history {
            "-"
        } else {
            ""
        };
        let next = task.nearest_date().map(local).unwrap_or_default();
        println!(
            "{:<2} {:<9} {:<24} {:<12} {:<22} {:<16}",
            marker,
            short_id(&task.id),
            truncate(&task.company_name, 24),
            task.application_type.to_string(),
            task.phase.to_string(),
            next
        );
    }
}

fn print_task(task: &Task) {
    println!("Task {}", task.id);
    println!("Company: {} ({})", task.company_name, short_id(&task.company_id));
    println!("Type: {}", task.application_type);
    println!("Phase: {}", task.phase);
    if let Some(deadline) = task.deadline {
        println!("Deadline: {}", local(deadline));
    }
    if let Some(date) = task.event_date {
        println!("Event date: {}", local(date));
    }
    if let Some(date) = task.event_end_date {
        println!("Event end: {}", local(date));
    }
    match (task.start_time, task.end_time) {
        (Some(start), Some(end)) => println!("Time: {}-{}", start.format("%H:%M"), end.format("%H:%M")),
        (Some(start), None) => println!("Starts: {}", start.format("%H:%M")),
        (None, Some(end)) => println!("Ends: {}", end.format("%H:%M")),
        (None, None) => {}
    }
    if task.is_history {
        let done = task.completed_at.map(local).unwrap_or_default();
        println!("Archived: {done}");
    }
    if !task.note.is_empty() {
        println!("\nNote:\n{}", textwrap::fill(&task.note, 80));
    }
    for (i, q) in task.es_questions.iter().enumerate() {
        println!("\nQ{}: {}", i + 1, textwrap::fill(&q.question, 78));
        if !q.answer.is_empty() {
            println!("{}", textwrap::indent(&textwrap::fill(&q.answer, 76), "  "));
        }
    }
}

fn print_companies(companies: &[&Company]) {
    if companies.is_empty() {
        println!("No companies found.");
        return;
    }
    println!("{:<9} {:<30} {:<20} {:<8}", "ID", "NAME", "INDUSTRY", "PRIORITY");
    println!("{}", "-".repeat(70));
    for company in companies {
        println!(
            "{:<9} {:<30} {:<20} {:<8}",
            short_id(&company.id),
            truncate(&company.name, 30),
            truncate(&company.industry, 20),
            company.priority.to_string()
        );
    }
}

fn print_text(text: &CommonText) {
    println!("{} ({})", text.title, text.id);
    for length in TextLength::ALL {
        let body = text.text(length);
        println!(
            "\n[{} chars target, {} written]",
            length.chars(),
            text.char_count(length)
        );
        if body.is_empty() {
            println!("(empty)");
        } else {
            println!("{}", textwrap::fill(body, 80));
        }
    }
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.db, cli.user, cli.log);
    init_logging(&config.log_filter);

    let store = SqliteStore::open(&config.db_path)?;
    match cli.command {
        Commands::Init => {
            store.init()?;
            println!("Database initialized at {}", store.path().display());
        }
        command => {
            store.ensure_initialized()?;
            run(&Tracker::new(store, config.owner), command).await?;
        }
    }
    Ok(())
}

async fn run(tracker: &Tracker<SqliteStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Company { command } => company_command(tracker, command).await?,
        Commands::Task { command } => task_command(tracker, command).await?,
        Commands::Text { command } => text_command(tracker, command).await?,
        Commands::Stats => {
            let tasks = tracker.tasks().list().await?;
            println!("Active tasks by phase:");
            for bucket in views::phase_distribution(&tasks) {
                match bucket.phase {
                    Some(phase) => println!("  {:<24} {:>4}", phase.to_string(), bucket.count),
                    None => println!("  (no active tasks)"),
                }
            }
            println!();
            println!(
                "{:<12} {:>12} {:>8} {:>10} {:>8}",
                "TYPE", "IN PROGRESS", "OFFER", "REJECTED", "TOTAL"
            );
            println!("{}", "-".repeat(54));
            for tally in views::outcome_tally(&tasks) {
                println!(
                    "{:<12} {:>12} {:>8} {:>10} {:>8}",
                    tally.application_type.to_string(),
                    tally.in_progress,
                    tally.offer,
                    tally.rejected,
                    tally.total()
                );
            }
        }
        Commands::Calendar { month } => {
            let (year, month) = match month {
                Some(m) => parse_month(&m)?,
                None => {
                    let today = Local::now().date_naive();
                    (today.year(), today.month())
                }
            };
            let tasks = tracker.tasks().list().await?;
            let agenda = views::month_agenda(&tasks, year, month, &Local);
            if agenda.is_empty() {
                println!("Nothing scheduled in {year}-{month:02}.");
            }
            for (day, tasks) in agenda {
                println!("{}", day.format("%a %Y-%m-%d"));
                for task in tasks {
                    let when = task
                        .start_time
                        .map(|t| t.format("%H:%M").to_string())
                        .unwrap_or_else(|| "     ".to_string());
                    println!("  {} {} - {}", when, task.company_name, task.phase);
                }
            }
        }
        Commands::Watch => {
            let mut feed = tracker.tasks().subscribe();
            println!("Watching for changes, Ctrl-C to stop.");
            loop {
                tokio::select! {
                    snapshot = feed.next() => match snapshot {
                        Some(tasks) => {
                            println!();
                            print_tasks(&views::active_tasks(&tasks), SystemClock.now());
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            feed.detach();
        }
    }

    Ok(())
}

async fn company_command(tracker: &Tracker<SqliteStore>, command: CompanyCommands) -> Result<()> {
    let repo = tracker.companies();
    match command {
        CompanyCommands::Add {
            name,
            industry,
            priority,
            mypage_id,
            url,
        } => {
            let mut draft = NewCompany::new(tracker.owner(), name);
            draft.industry = industry.unwrap_or_default();
            draft.priority = priority;
            draft.mypage_id = mypage_id.unwrap_or_default();
            draft.url = url.unwrap_or_default();
            let id = repo.create(draft).await?;
            println!("Added company {}", short_id(&id));
        }
        CompanyCommands::List { search } => {
            let companies = repo.list().await?;
            let shown = match search {
                Some(term) => views::search_companies(&companies, &term),
                None => companies.iter().collect(),
            };
            print_companies(&shown);
        }
        CompanyCommands::Show { id } => {
            let companies = repo.list().await?;
            let company = pick(&companies, &id, |c| c.id.as_str())?;
            println!("{} ({})", company.name, company.id);
            println!("Priority: {}", company.priority);
            if !company.industry.is_empty() {
                println!("Industry: {}", company.industry);
            }
            if !company.url.is_empty() {
                println!("URL: {}", company.url);
            }
            if !company.mypage_id.is_empty() {
                println!("My page ID: {}", company.mypage_id);
            }
            println!("Added: {}", local(company.created_at));

            let tasks = tracker.tasks().list().await?;
            let history = views::company_history(&tasks, &company.id);
            println!();
            print_tasks(&history, SystemClock.now());
        }
        CompanyCommands::Edit {
            id,
            name,
            industry,
            priority,
            mypage_id,
            url,
        } => {
            let companies = repo.list().await?;
            let company = pick(&companies, &id, |c| c.id.as_str())?;
            let patch = CompanyPatch {
                name,
                industry,
                priority,
                mypage_id,
                url,
            };
            repo.update(&company.id, patch).await?;
            println!("Updated company {}", short_id(&company.id));
        }
        CompanyCommands::Delete { id, yes } => {
            let companies = repo.list().await?;
            let company = pick(&companies, &id, |c| c.id.as_str())?;
            require_yes(yes, &format!("'{}' and its tasks", company.name))?;
            let report = tracker.delete_company_cascade(&company.id).await?;
            println!(
                "Deleted '{}' and {} task(s)",
                company.name,
                report.task_ids.len()
            );
        }
    }
    Ok(())
}

async fn task_command(tracker: &Tracker<SqliteStore>, command: TaskCommands) -> Result<()> {
    let repo = tracker.tasks();
    match command {
        TaskCommands::Add { company, fields } => {
            let companies = tracker.companies().list().await?;
            let company = pick(&companies, &company, |c| c.id.as_str())?;
            let mut draft = NewTask::new(tracker.owner(), company.id.clone(), "");
            fields.fill_draft(&mut draft);
            let id = tracker.add_task(draft).await?;
            println!("Added task {} for {}", short_id(&id), company.name);
        }
        TaskCommands::List { all } => {
            let tasks = repo.list().await?;
            let shown = if all {
                let mut all: Vec<&Task> = views::active_tasks(&tasks);
                all.extend(tasks.iter().filter(|t| t.is_history));
                all
            } else {
                views::active_tasks(&tasks)
            };
            print_tasks(&shown, SystemClock.now());
        }
        TaskCommands::Show { id } => {
            let tasks = repo.list().await?;
            print_task(pick(&tasks, &id, |t| t.id.as_str())?);
        }
        TaskCommands::Edit { id, fields } => {
            let tasks = repo.list().await?;
            let task = pick(&tasks, &id, |t| t.id.as_str())?;
            let mut patch = TaskPatch::default();
            fields.apply_to(&mut patch);
            repo.update(&task.id, patch).await?;
            println!("Updated task {}", short_id(&task.id));
        }
        TaskCommands::Question {
            id,
            question,
            answer,
        } => {
            let tasks = repo.list().await?;
            let task = pick(&tasks, &id, |t| t.id.as_str())?;
            let mut questions = task.es_questions.clone();
            questions.push(EsQuestion { question, answer });
            let patch = TaskPatch {
                es_questions: Some(questions),
                ..TaskPatch::default()
            };
            repo.update(&task.id, patch).await?;
            println!("Added question {} to task {}", task.es_questions.len() + 1, short_id(&task.id));
        }
        TaskCommands::Progress {
            id,
            fields,
            drop_questions,
        } => {
            let tasks = repo.list().await?;
            let task = pick(&tasks, &id, |t| t.id.as_str())?;
            let mut overrides = suggested_overrides(task);
            fields.apply_to(&mut overrides);
            if drop_questions {
                overrides.es_questions = None;
            }
            let next_phase = overrides.phase.unwrap_or(task.phase);
            let progression = tracker.progress_task(task, overrides).await?;
            println!(
                "Archived {} ({}), next stage {} ({})",
                short_id(&progression.archived_id),
                task.phase,
                short_id(&progression.successor_id),
                next_phase
            );
        }
        TaskCommands::Delete { id, yes } => {
            let tasks = repo.list().await?;
            let task = pick(&tasks, &id, |t| t.id.as_str())?;
            require_yes(yes, "this task")?;
            repo.delete(&task.id).await?;
            println!("Deleted task {}", short_id(&task.id));
        }
    }
    Ok(())
}

async fn text_command(tracker: &Tracker<SqliteStore>, command: TextCommands) -> Result<()> {
    let repo = tracker.texts();
    match command {
        TextCommands::Add {
            title,
            short,
            medium,
            long,
        } => {
            let mut draft = NewCommonText::new(tracker.owner(), title);
            draft.text_300 = short.unwrap_or_default();
            draft.text_400 = medium.unwrap_or_default();
            draft.text_500 = long.unwrap_or_default();
            let id = repo.create(draft).await?;
            println!("Added text {}", short_id(&id));
        }
        TextCommands::List => {
            let texts = repo.list().await?;
            if texts.is_empty() {
                println!("No texts found.");
            } else {
                println!("{:<9} {:<36} {:>6} {:>6} {:>6}", "ID", "TITLE", "300", "400", "500");
                println!("{}", "-".repeat(68));
                for text in &texts {
                    println!(
                        "{:<9} {:<36} {:>6} {:>6} {:>6}",
                        short_id(&text.id),
                        truncate(&text.title, 36),
                        text.char_count(TextLength::Short),
                        text.char_count(TextLength::Medium),
                        text.char_count(TextLength::Long)
                    );
                }
            }
        }
        TextCommands::Show { id } => {
            let texts = repo.list().await?;
            print_text(pick(&texts, &id, |t| t.id.as_str())?);
        }
        TextCommands::Edit {
            id,
            title,
            short,
            medium,
            long,
        } => {
            let texts = repo.list().await?;
            let text = pick(&texts, &id, |t| t.id.as_str())?;
            let patch = CommonTextPatch {
                title,
                text_300: short,
                text_400: medium,
                text_500: long,
            };
            repo.update(&text.id, patch).await?;
            println!("Updated text {}", short_id(&text.id));
        }
        TextCommands::Delete { id, yes } => {
            let texts = repo.list().await?;
            let text = pick(&texts, &id, |t| t.id.as_str())?;
            require_yes(yes, &format!("'{}'", text.title))?;
            repo.delete(&text.id).await?;
            println!("Deleted text '{}'", text.title);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("株式会社サンプル商事", 6), "株式会...");
    }

    #[test]
    fn pick_accepts_unique_prefix() {
        let ids = vec!["abc123".to_string(), "abd456".to_string()];
        assert_eq!(pick(&ids, "abc", |s| s.as_str()).unwrap(), "abc123");
        assert!(pick(&ids, "ab", |s| s.as_str()).is_err());
        assert!(pick(&ids, "zz", |s| s.as_str()).is_err());
        assert!(pick(&ids, "", |s| s.as_str()).is_err());
    }

    #[test]
    fn date_only_means_end_of_local_day() {
        let parsed = parse_when("2026-04-10").unwrap().with_timezone(&Local);
        assert_eq!(parsed.date_naive(), NaiveDate::from_ymd_opt(2026, 4, 10).unwrap());
        assert_eq!(parsed.format("%H:%M").to_string(), "23:59");
        assert!(parse_when("10/04/2026").is_err());
    }

    #[test]
    fn month_argument() {
        assert_eq!(parse_month("2026-11").unwrap(), (2026, 11));
        assert!(parse_month("2026-13").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
