//! Attendance aggregation: pure folds over events plus the store-backed engine.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate};
use tracing::debug;

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{
    AggregateSummary, AttendanceEvent, Course, CourseAnalytic, CourseId, DailyEntry, DailyView,
    DateRange, EventQuery, MonthlyView, Scope, SessionTally, StudentId, WeeklyEntry, WeeklyView,
    YearMonth,
};
use crate::retry::RetryPolicy;
use crate::store::Backend;

/// Latest session dates shown in the per-session panel.
pub const RECENT_SESSIONS: usize = 7;

/// `present / (present + absent) * 100`, rounded to two decimals; 0 when nothing was recorded.
pub fn percentage(present: usize, absent: usize) -> f64 {
    let total = present + absent;
    if total == 0 {
        return 0.0;
    }
    round2(present as f64 / total as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

pub fn week_label(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

pub fn daily_view(events: &[AttendanceEvent]) -> DailyView {
    let mut rows: DailyView = events
        .iter()
        .map(|event| DailyEntry {
            date: event.date,
            course_id: event.course_id.clone(),
            status: event.status,
        })
        .collect();
    rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.course_id.cmp(&b.course_id)));
    rows
}

pub fn weekly_view(events: &[AttendanceEvent]) -> WeeklyView {
    let mut buckets: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();

    for event in events {
        let entry = buckets.entry(week_start(event.date)).or_insert((0, 0));
        if event.is_present() {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(start, (present, absent))| WeeklyEntry {
            week_label: week_label(start),
            week_start: start,
            percentage: percentage(present, absent),
        })
        .collect()
}

pub fn monthly_view(events: &[AttendanceEvent], month: YearMonth) -> MonthlyView {
    events
        .iter()
        .filter(|event| month.contains(event.date))
        .fold(MonthlyView::default(), |mut view, event| {
            if event.is_present() {
                view.present += 1;
            } else {
                view.absent += 1;
            }
            view
        })
}

/// One entry per course in `courses`, in the given order; a course without
/// events scores 0.
pub fn course_analytics(
    courses: &[Course],
    events: &[AttendanceEvent],
    month: Option<YearMonth>,
) -> Vec<CourseAnalytic> {
    let mut counts: BTreeMap<&CourseId, (usize, usize)> = BTreeMap::new();

    for event in events {
        if month.is_some_and(|month| !month.contains(event.date)) {
            continue;
        }
        let entry = counts.entry(&event.course_id).or_insert((0, 0));
        if event.is_present() {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    courses
        .iter()
        .map(|course| {
            let (present, absent) = counts.get(&course.id).copied().unwrap_or((0, 0));
            CourseAnalytic {
                course_id: course.id.clone(),
                name: course.name.clone(),
                attendance_percentage: percentage(present, absent),
            }
        })
        .collect()
}

/// Overall attendance is the unweighted mean of the per-course percentages:
/// every course counts once regardless of how many students it has.
pub fn summarize(total_students: usize, per_course: Vec<CourseAnalytic>) -> AggregateSummary {
    let overall_percentage = if per_course.is_empty() {
        0.0
    } else {
        let sum: f64 = per_course
            .iter()
            .map(|course| course.attendance_percentage)
            .sum();
        round2(sum / per_course.len() as f64)
    };

    AggregateSummary {
        total_students,
        overall_percentage,
        per_course,
    }
}

/// Head counts per session date in `month`, most recent first.
pub fn session_tallies(events: &[AttendanceEvent], month: YearMonth) -> Vec<SessionTally> {
    let mut by_date: BTreeMap<NaiveDate, SessionTally> = BTreeMap::new();

    for event in events.iter().filter(|event| month.contains(event.date)) {
        let tally = by_date.entry(event.date).or_insert(SessionTally {
            date: event.date,
            present: 0,
            absent: 0,
        });
        if event.is_present() {
            tally.present += 1;
        } else {
            tally.absent += 1;
        }
    }

    by_date.into_values().rev().collect()
}

/// Computes view models for an authorized scope.
pub struct AnalyticsEngine {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl AnalyticsEngine {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    async fn events(&self, query: EventQuery) -> AnalyticsResult<Vec<AttendanceEvent>> {
        let events = self
            .retry
            .run("query_events", || self.backend.query_events(&query))
            .await?;
        debug!(events = events.len(), "loaded events for aggregation");
        Ok(events)
    }

    async fn courses_in(&self, course_ids: &BTreeSet<CourseId>) -> AnalyticsResult<Vec<Course>> {
        let courses: Vec<Course> = self
            .retry
            .run("list_courses", || self.backend.list_courses())
            .await?
            .into_iter()
            .filter(|course| course_ids.contains(&course.id))
            .collect();

        if courses.len() != course_ids.len() {
            let known: HashSet<&CourseId> = courses.iter().map(|course| &course.id).collect();
            if let Some(missing) = course_ids.iter().find(|id| !known.contains(id)) {
                return Err(AnalyticsError::NotFound(format!("course {missing}")));
            }
        }
        Ok(courses)
    }

    /// Chronological log of one student's recorded marks. Days without a
    /// recorded mark are omitted rather than counted as absences.
    pub async fn compute_daily(
        &self,
        student_id: &StudentId,
        window: Option<DateRange>,
    ) -> AnalyticsResult<DailyView> {
        self.retry
            .run("find_student", || self.backend.find_student(student_id))
            .await?
            .ok_or_else(|| AnalyticsError::NotFound(format!("student {student_id}")))?;

        let events = self
            .events(EventQuery {
                student_id: Some(student_id.clone()),
                course_ids: None,
                date_range: window,
            })
            .await?;
        Ok(daily_view(&events))
    }

    pub async fn compute_weekly(&self, scope: &Scope) -> AnalyticsResult<WeeklyView> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let events = self.events(scope.event_query(None)).await?;
        Ok(weekly_view(&events))
    }

    pub async fn compute_monthly(&self, scope: &Scope, month: YearMonth) -> AnalyticsResult<MonthlyView> {
        if scope.is_empty() {
            return Ok(MonthlyView::default());
        }
        let events = self
            .events(scope.event_query(Some(month.date_range())))
            .await?;
        Ok(monthly_view(&events, month))
    }

    pub async fn compute_course_analytics(
        &self,
        scope: &Scope,
        month: Option<YearMonth>,
    ) -> AnalyticsResult<Vec<CourseAnalytic>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let courses = self.courses_in(&scope.course_ids()).await?;
        let events = self
            .events(scope.event_query(month.map(|month| month.date_range())))
            .await?;
        Ok(course_analytics(&courses, &events, month))
    }

    pub async fn compute_summary(&self, scope: &Scope) -> AnalyticsResult<AggregateSummary> {
        if scope.is_empty() {
            return Ok(AggregateSummary::empty());
        }
        let per_course = self.compute_course_analytics(scope, None).await?;
        let students = self
            .retry
            .run("list_students", || self.backend.list_students(scope))
            .await?;
        let total_students = students
            .iter()
            .map(|student| &student.id)
            .collect::<HashSet<_>>()
            .len();

        Ok(summarize(total_students, per_course))
    }

    pub async fn compute_session_tallies(
        &self,
        scope: &Scope,
        month: YearMonth,
    ) -> AnalyticsResult<Vec<SessionTally>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let events = self
            .events(scope.event_query(Some(month.date_range())))
            .await?;
        Ok(session_tallies(&events, month))
    }
}
