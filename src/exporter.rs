use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{EffectiveSelection, Scope};
use crate::store::{Backend, ReportRequest};

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportKind {
    #[default]
    Attendance,
    School,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Attendance => "attendance",
            ReportKind::School => "school_report",
        }
    }
}

impl FromStr for ReportKind {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "attendance" => Ok(ReportKind::Attendance),
            "school" | "school_report" => Ok(ReportKind::School),
            other => Err(AnalyticsError::Validation(format!("unknown report kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Presentation-side receiver of finished downloads.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn deliver(&self, artifact: &ReportArtifact) -> AnalyticsResult<()>;
}

/// Writes artifacts into a directory under their report filename.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, artifact: &ReportArtifact) -> PathBuf {
        self.dir.join(&artifact.filename)
    }
}

#[async_trait]
impl DownloadSink for DirectorySink {
    async fn deliver(&self, artifact: &ReportArtifact) -> AnalyticsResult<()> {
        let path = self.path_for(artifact);
        tokio::fs::write(&path, &artifact.bytes)
            .await
            .map_err(|error| AnalyticsError::Store(format!("writing {}: {error}", path.display())))
    }
}

/// Clears the in-flight flag however the export ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ReportExporter {
    backend: Arc<dyn Backend>,
    sink: Arc<dyn DownloadSink>,
    in_flight: AtomicBool,
}

impl ReportExporter {
    pub fn new(backend: Arc<dyn Backend>, sink: Arc<dyn DownloadSink>) -> Self {
        Self {
            backend,
            sink,
            in_flight: AtomicBool::new(false),
        }
    }

    /// True while an export is running; the trigger should be disabled.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetch the report for an authorized selection and hand it to the sink.
    ///
    /// A second call while one is running fails with `ExportInProgress`
    /// and touches nothing. Failures are never retried here.
    pub async fn export_report(
        &self,
        selection: &EffectiveSelection,
        kind: ReportKind,
    ) -> AnalyticsResult<ReportArtifact> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("ignoring duplicate export trigger");
            return Err(AnalyticsError::ExportInProgress);
        }
        let _guard = InFlight(&self.in_flight);

        let course_ids = match &selection.scope {
            Scope::Courses { course_ids } if course_ids.is_empty() => {
                return Err(AnalyticsError::Validation(
                    "select at least one course to export".to_string(),
                ))
            }
            Scope::Courses { course_ids } => course_ids.clone(),
            Scope::Student { .. } => {
                return Err(AnalyticsError::Authorization(
                    "roster reports are not available to students".to_string(),
                ))
            }
        };

        let names: Vec<String> = self
            .backend
            .list_courses()
            .await?
            .into_iter()
            .filter(|course| course_ids.contains(&course.id))
            .map(|course| course.name)
            .collect();
        if names.len() != course_ids.len() {
            return Err(AnalyticsError::NotFound(
                "report scope names an unknown course".to_string(),
            ));
        }

        let filename = report_filename(kind, &scope_name(&names), &selection.month.to_string());
        let request = ReportRequest {
            course_ids,
            month: selection.month,
        };
        let bytes = self.backend.request_report(&request).await?;
        let artifact = ReportArtifact {
            filename,
            content_type: XLSX_CONTENT_TYPE,
            bytes,
        };

        self.sink.deliver(&artifact).await?;
        info!(filename = %artifact.filename, bytes = artifact.bytes.len(), "report exported");
        Ok(artifact)
    }
}

pub fn report_filename(kind: ReportKind, scope_name: &str, month: &str) -> String {
    format!("{}_{}_{}.xlsx", kind.as_str(), scope_name, month)
}

/// Slug of the only course name, or `combined` for several courses.
pub fn scope_name(course_names: &[String]) -> String {
    match course_names {
        [name] => slugify(name),
        _ => "combined".to_string(),
    }
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "course".to_string()
    } else {
        slug.to_string()
    }
}
