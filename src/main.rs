use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use attendance_insights::aggregate::AnalyticsEngine;
use attendance_insights::config::load_settings;
use attendance_insights::controller::{ControllerConfig, Dashboard, SelectionController, Trend, ViewState};
use attendance_insights::db::{self, PgStore};
use attendance_insights::exporter::{DirectorySink, ReportExporter, ReportKind};
use attendance_insights::models::{
    AggregateSummary, CourseId, Granularity, Identity, Role, Selection, StudentId, YearMonth,
};
use attendance_insights::report;
use attendance_insights::scope::ScopeResolver;
use attendance_insights::store::Backend;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "attendance-insights")]
#[command(about = "Role-scoped attendance analytics and report export", long_about = None)]
struct Cli {
    /// Identity the request is made as
    #[arg(long, global = true, default_value = "admin")]
    user: String,
    #[arg(long, global = true, default_value = "admin")]
    role: Role,
    /// Comma-separated course ids; defaults to every course the identity may see
    #[arg(long, global = true, value_delimiter = ',')]
    courses: Vec<String>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import attendance marks from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List active courses
    Courses,
    /// Totals and per-course attendance
    Summary,
    /// Attendance percentage per ISO week
    Weekly,
    /// Present/absent counts for one month
    Monthly {
        #[arg(long)]
        month: Option<YearMonth>,
    },
    /// One student's recorded marks
    Daily {
        #[arg(long)]
        student: String,
        #[arg(long)]
        month: Option<YearMonth>,
    },
    /// Summary plus the trend for the chosen granularity
    Dashboard {
        #[arg(long)]
        month: Option<YearMonth>,
        #[arg(long, default_value = "daily")]
        granularity: Granularity,
    },
    /// Generate a markdown summary
    Report {
        #[arg(long)]
        month: Option<YearMonth>,
        #[arg(long, default_value = "attendance-summary.md")]
        out: PathBuf,
    },
    /// Download the monthly roster spreadsheet
    Export {
        #[arg(long)]
        month: YearMonth,
        #[arg(long, default_value = "attendance")]
        kind: ReportKind,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = load_settings();
    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let store = PgStore::connect(&database_url, settings.max_connections).await?;

    let retry = settings.retry_policy();
    let backend: Arc<dyn Backend> = Arc::new(store.clone());
    let resolver = Arc::new(ScopeResolver::new(backend.clone(), retry));
    let engine = Arc::new(AnalyticsEngine::new(backend.clone(), retry));
    let identity = Identity::new(cli.user.clone(), cli.role);

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let written = db::import_csv(store.pool(), &csv).await?;
            println!("Wrote {written} attendance marks from {}.", csv.display());
        }
        Commands::Courses => {
            let courses = backend.list_courses().await?;
            if cli.json {
                print_json(&courses)?;
            } else {
                for course in courses {
                    println!("- {} ({})", course.name, course.id);
                }
            }
        }
        Commands::Summary => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let selection = Selection::new(current_month()).with_courses(requested);
            let effective = resolver.resolve(&identity, &selection).await?;
            let summary = engine.compute_summary(&effective.scope).await?;
            if cli.json {
                print_json(&summary)?;
            } else {
                print_summary(&summary);
            }
        }
        Commands::Weekly => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let selection = Selection::new(current_month()).with_courses(requested);
            let effective = resolver.resolve(&identity, &selection).await?;
            let weekly = engine.compute_weekly(&effective.scope).await?;
            if cli.json {
                print_json(&weekly)?;
            } else if weekly.is_empty() {
                println!("No attendance recorded for this scope.");
            } else {
                for week in weekly {
                    println!("- {} (from {}): {:.2}%", week.week_label, week.week_start, week.percentage);
                }
            }
        }
        Commands::Monthly { month } => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let month = month.unwrap_or_else(current_month);
            let selection = Selection::new(month).with_courses(requested);
            let effective = resolver.resolve(&identity, &selection).await?;
            let monthly = engine.compute_monthly(&effective.scope, month).await?;
            if cli.json {
                print_json(&monthly)?;
            } else {
                println!("Attendance for {month}:");
                for (name, value) in monthly.entries() {
                    println!("- {name}: {value}");
                }
            }
        }
        Commands::Daily { student, month } => {
            let student = StudentId::new(student);
            resolver.authorize_student(&identity, &student).await?;
            let daily = engine
                .compute_daily(&student, month.map(|month| month.date_range()))
                .await?;
            if cli.json {
                print_json(&daily)?;
            } else if daily.is_empty() {
                println!("No attendance recorded for {student}.");
            } else {
                for row in daily {
                    println!("- {} {}: {}", row.date, row.course_id, row.status.as_str());
                }
            }
        }
        Commands::Dashboard { month, granularity } => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let mut selection = Selection::new(month.unwrap_or_else(current_month));
            selection.granularity = granularity;
            let config = ControllerConfig {
                recompute_timeout: settings.recompute_timeout(),
                ..ControllerConfig::default()
            };
            let mut controller =
                SelectionController::new(identity, selection, resolver, engine, config);
            controller.set_courses(requested);

            match controller.settle().await {
                ViewState::Ready { dashboard, .. } => {
                    if cli.json {
                        print_json(dashboard)?;
                    } else {
                        print_dashboard(dashboard);
                    }
                }
                ViewState::Failed { error, .. } => return Err(error.clone().into()),
                ViewState::Idle | ViewState::Loading { .. } => {
                    anyhow::bail!("dashboard did not settle")
                }
            }
        }
        Commands::Report { month, out } => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let month = month.unwrap_or_else(current_month);
            let selection = Selection::new(month).with_courses(requested);
            let effective = resolver.resolve(&identity, &selection).await?;
            let summary = engine.compute_summary(&effective.scope).await?;
            let weekly = engine.compute_weekly(&effective.scope).await?;
            let sessions = engine.compute_session_tallies(&effective.scope, month).await?;
            let label = scope_label(&summary);
            let markdown = report::build_summary_markdown(&label, month, &summary, &weekly, &sessions);
            std::fs::write(&out, markdown)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Export { month, kind } => {
            let requested = requested_courses(backend.as_ref(), &identity, &cli.courses).await?;
            let selection = Selection::new(month).with_courses(requested);
            let effective = resolver.resolve(&identity, &selection).await?;
            let sink = DirectorySink::new(&settings.export_dir);
            let exporter = ReportExporter::new(backend, Arc::new(sink));
            let artifact = exporter.export_report(&effective, kind).await?;
            println!(
                "Report saved to {}.",
                settings.export_dir.join(&artifact.filename).display()
            );
        }
    }

    Ok(())
}

/// Explicit `--courses`, or everything the identity is allowed to see.
async fn requested_courses(
    backend: &dyn Backend,
    identity: &Identity,
    explicit: &[String],
) -> anyhow::Result<Vec<CourseId>> {
    if !explicit.is_empty() {
        return Ok(explicit.iter().map(CourseId::new).collect());
    }
    let courses = match identity.role {
        Role::Admin => backend
            .list_courses()
            .await?
            .into_iter()
            .map(|course| course.id)
            .collect(),
        Role::Teacher => backend.assigned_courses(&identity.id).await?.into_iter().collect(),
        Role::Student => Vec::new(),
    };
    Ok(courses)
}

fn current_month() -> YearMonth {
    YearMonth::of(Utc::now().date_naive())
}

fn scope_label(summary: &AggregateSummary) -> String {
    match summary.per_course.as_slice() {
        [] => "no courses".to_string(),
        [course] => course.name.clone(),
        many => format!("{} courses", many.len()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(summary: &AggregateSummary) {
    println!("Students: {}", summary.total_students);
    println!("Overall attendance: {:.2}%", summary.overall_percentage);
    if summary.per_course.is_empty() {
        println!("No courses in scope.");
        return;
    }
    for course in &summary.per_course {
        println!("- {} ({}): {:.2}%", course.name, course.course_id, course.attendance_percentage);
    }
}

fn print_dashboard(dashboard: &Dashboard) {
    print_summary(&dashboard.summary);
    println!();
    match &dashboard.trend {
        Trend::Daily(rows) => {
            println!("Daily log:");
            for row in rows {
                println!("- {} {}: {}", row.date, row.course_id, row.status.as_str());
            }
        }
        Trend::Sessions(sessions) => {
            println!("Recent sessions ({} held):", sessions.len());
            for tally in sessions.iter().take(attendance_insights::aggregate::RECENT_SESSIONS) {
                println!("- {}: {} present, {} absent", tally.date, tally.present, tally.absent);
            }
        }
        Trend::Weekly(weeks) => {
            println!("Weekly trend:");
            for week in weeks {
                println!("- {}: {:.2}%", week.week_label, week.percentage);
            }
        }
        Trend::Monthly(monthly) => {
            println!("Monthly totals for {}:", dashboard.selection.month);
            for (name, value) in monthly.entries() {
                println!("- {name}: {value}");
            }
        }
    }
}
