//! In-memory backend for unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::exporter::{DownloadSink, ReportArtifact};
use crate::models::{
    AttendanceEvent, AttendanceStatus, Course, CourseId, EventQuery, Scope, Student, StudentId,
};
use crate::store::{AttendanceStore, CourseRegistry, ReportRequest, TeacherAssignments};

pub fn day(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

pub fn ids(raw: &[&str]) -> BTreeSet<CourseId> {
    raw.iter().map(|id| CourseId::new(*id)).collect()
}

#[derive(Default)]
pub struct MemoryStore {
    courses: Vec<Course>,
    students: Vec<Student>,
    events: Vec<AttendanceEvent>,
    assignments: HashMap<String, BTreeSet<CourseId>>,
    query_delays: HashMap<BTreeSet<CourseId>, Duration>,
    report_delay: Duration,
    failing_queries: AtomicU32,
    failing_reports: AtomicU32,
    pub event_queries: AtomicUsize,
    pub report_requests: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn course(mut self, id: &str, name: &str) -> Self {
        self.courses.push(Course {
            id: CourseId::new(id),
            name: name.to_string(),
        });
        self
    }

    pub fn student(mut self, id: &str, course_id: &str) -> Self {
        self.students.push(Student {
            id: StudentId::new(id),
            name: format!("Student {id}"),
            roll_no: format!("R-{id}"),
            course_id: CourseId::new(course_id),
        });
        self
    }

    pub fn mark(mut self, student_id: &str, course_id: &str, date: &str, status: AttendanceStatus) -> Self {
        self.events.push(AttendanceEvent {
            student_id: StudentId::new(student_id),
            course_id: CourseId::new(course_id),
            date: day(date),
            status,
        });
        self
    }

    pub fn assign(mut self, teacher_id: &str, course_id: &str) -> Self {
        self.assignments
            .entry(teacher_id.to_string())
            .or_default()
            .insert(CourseId::new(course_id));
        self
    }

    /// Event queries for exactly this course set sleep first.
    pub fn delay_queries(mut self, course_ids: &[&str], delay: Duration) -> Self {
        self.query_delays.insert(ids(course_ids), delay);
        self
    }

    pub fn delay_reports(mut self, delay: Duration) -> Self {
        self.report_delay = delay;
        self
    }

    pub fn fail_queries(self, times: u32) -> Self {
        self.failing_queries.store(times, Ordering::SeqCst);
        self
    }

    pub fn fail_reports(self, times: u32) -> Self {
        self.failing_reports.store(times, Ordering::SeqCst);
        self
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CourseRegistry for MemoryStore {
    async fn list_courses(&self) -> AnalyticsResult<Vec<Course>> {
        let mut courses = self.courses.clone();
        courses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(courses)
    }
}

#[async_trait]
impl TeacherAssignments for MemoryStore {
    async fn assigned_courses(&self, teacher_id: &str) -> AnalyticsResult<BTreeSet<CourseId>> {
        Ok(self.assignments.get(teacher_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn list_students(&self, scope: &Scope) -> AnalyticsResult<Vec<Student>> {
        Ok(self
            .students
            .iter()
            .filter(|student| match scope {
                Scope::Courses { course_ids } => course_ids.contains(&student.course_id),
                Scope::Student { student_id, .. } => &student.id == student_id,
            })
            .cloned()
            .collect())
    }

    async fn find_student(&self, id: &StudentId) -> AnalyticsResult<Option<Student>> {
        Ok(self.students.iter().find(|student| &student.id == id).cloned())
    }

    async fn query_events(&self, query: &EventQuery) -> AnalyticsResult<Vec<AttendanceEvent>> {
        self.event_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = query
            .course_ids
            .as_ref()
            .and_then(|course_ids| self.query_delays.get(course_ids))
        {
            tokio::time::sleep(*delay).await;
        }
        if Self::take_failure(&self.failing_queries) {
            return Err(AnalyticsError::TransientFetch("connection reset".into()));
        }
        Ok(self
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect())
    }

    async fn request_report(&self, request: &ReportRequest) -> AnalyticsResult<Vec<u8>> {
        self.report_requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.report_delay).await;
        if Self::take_failure(&self.failing_reports) {
            return Err(AnalyticsError::TransientFetch("gateway timeout".into()));
        }
        Ok(format!("report {} {:?}", request.month, request.course_ids).into_bytes())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl DownloadSink for RecordingSink {
    async fn deliver(&self, artifact: &ReportArtifact) -> AnalyticsResult<()> {
        self.delivered
            .lock()
            .unwrap()
            .push(artifact.filename.clone());
        Ok(())
    }
}
