//! Contracts consumed from the attendance backend.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::AnalyticsResult;
use crate::models::{AttendanceEvent, Course, CourseId, EventQuery, Scope, Student, StudentId, YearMonth};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub course_ids: BTreeSet<CourseId>,
    pub month: YearMonth,
}

#[async_trait]
pub trait CourseRegistry: Send + Sync {
    /// Active courses, ordered by name.
    async fn list_courses(&self) -> AnalyticsResult<Vec<Course>>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn list_students(&self, scope: &Scope) -> AnalyticsResult<Vec<Student>>;

    async fn find_student(&self, id: &StudentId) -> AnalyticsResult<Option<Student>>;

    async fn query_events(&self, query: &EventQuery) -> AnalyticsResult<Vec<AttendanceEvent>>;

    /// Binary report for the courses and month; the bytes are opaque here.
    async fn request_report(&self, request: &ReportRequest) -> AnalyticsResult<Vec<u8>>;
}

#[async_trait]
pub trait TeacherAssignments: Send + Sync {
    async fn assigned_courses(&self, teacher_id: &str) -> AnalyticsResult<BTreeSet<CourseId>>;
}

/// Everything the analytics core reads from.
pub trait Backend: CourseRegistry + AttendanceStore + TeacherAssignments {}

impl<T> Backend for T where T: CourseRegistry + AttendanceStore + TeacherAssignments {}
