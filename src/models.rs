use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseId(pub String);

impl CourseId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub String);

impl StudentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Absent => "Absent",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "present" | "p" => Ok(AttendanceStatus::Present),
            "absent" | "a" => Ok(AttendanceStatus::Absent),
            other => Err(AnalyticsError::Validation(format!(
                "unknown attendance status `{other}`"
            ))),
        }
    }
}

/// One recorded attendance mark. Unique per (student, course, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

impl AttendanceEvent {
    pub fn is_present(&self) -> bool {
        self.status == AttendanceStatus::Present
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub roll_no: String,
    pub course_id: CourseId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl FromStr for Role {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(AnalyticsError::Validation(format!("unknown role `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Calendar month in `YYYY-MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, AnalyticsError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(AnalyticsError::Validation(format!(
                "month {year:04}-{month:02} is out of range"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|next| next.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn date_range(&self) -> DateRange {
        DateRange {
            start: self.first_day(),
            end: self.last_day(),
        }
    }
}

impl FromStr for YearMonth {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed =
            || AnalyticsError::Validation(format!("malformed month `{value}`, expected YYYY-MM"));
        let (year, month) = value.trim().split_once('-').ok_or_else(malformed)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(malformed());
        }
        let year: i32 = year.parse().map_err(|_| malformed())?;
        let month: u32 = month.parse().map_err(|_| malformed())?;
        YearMonth::new(year, month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for Granularity {
    type Err = AnalyticsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Granularity::Daily),
            "weekly" => Ok(Granularity::Weekly),
            "monthly" => Ok(Granularity::Monthly),
            other => Err(AnalyticsError::Validation(format!(
                "unknown granularity `{other}`"
            ))),
        }
    }
}

/// Filter state requested by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub course_ids: BTreeSet<CourseId>,
    pub month: YearMonth,
    pub granularity: Granularity,
}

impl Selection {
    pub fn new(month: YearMonth) -> Self {
        Self {
            course_ids: BTreeSet::new(),
            month,
            granularity: Granularity::default(),
        }
    }

    pub fn with_courses<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = CourseId>,
    {
        self.course_ids = ids.into_iter().collect();
        self
    }
}

/// Partial update to a [`Selection`]; unset fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPatch {
    pub course_ids: Option<BTreeSet<CourseId>>,
    pub month: Option<YearMonth>,
    pub granularity: Option<Granularity>,
}

impl SelectionPatch {
    pub fn apply_to(self, selection: &mut Selection) {
        if let Some(course_ids) = self.course_ids {
            selection.course_ids = course_ids;
        }
        if let Some(month) = self.month {
            selection.month = month;
        }
        if let Some(granularity) = self.granularity {
            selection.granularity = granularity;
        }
    }
}

/// The authorized subset of data a query may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    Courses { course_ids: BTreeSet<CourseId> },
    Student {
        student_id: StudentId,
        course_id: CourseId,
    },
}

impl Scope {
    pub fn courses<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = CourseId>,
    {
        Scope::Courses {
            course_ids: ids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Scope::Courses { course_ids } => course_ids.is_empty(),
            Scope::Student { .. } => false,
        }
    }

    pub fn course_ids(&self) -> BTreeSet<CourseId> {
        match self {
            Scope::Courses { course_ids } => course_ids.clone(),
            Scope::Student { course_id, .. } => BTreeSet::from([course_id.clone()]),
        }
    }

    pub fn student_id(&self) -> Option<&StudentId> {
        match self {
            Scope::Courses { .. } => None,
            Scope::Student { student_id, .. } => Some(student_id),
        }
    }

    pub fn event_query(&self, date_range: Option<DateRange>) -> EventQuery {
        EventQuery {
            student_id: self.student_id().cloned(),
            course_ids: Some(self.course_ids()),
            date_range,
        }
    }
}

/// Selection after resolution against an identity's permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSelection {
    pub scope: Scope,
    pub month: YearMonth,
    pub granularity: Granularity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub student_id: Option<StudentId>,
    pub course_ids: Option<BTreeSet<CourseId>>,
    pub date_range: Option<DateRange>,
}

impl EventQuery {
    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        if let Some(student_id) = &self.student_id {
            if &event.student_id != student_id {
                return false;
            }
        }
        if let Some(course_ids) = &self.course_ids {
            if !course_ids.contains(&event.course_id) {
                return false;
            }
        }
        if let Some(range) = &self.date_range {
            if !range.contains(event.date) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyEntry {
    pub date: NaiveDate,
    pub course_id: CourseId,
    pub status: AttendanceStatus,
}

pub type DailyView = Vec<DailyEntry>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyEntry {
    pub week_label: String,
    pub week_start: NaiveDate,
    pub percentage: f64,
}

pub type WeeklyView = Vec<WeeklyEntry>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyView {
    pub present: usize,
    pub absent: usize,
}

impl MonthlyView {
    pub fn entries(&self) -> [(&'static str, usize); 2] {
        [
            (AttendanceStatus::Present.as_str(), self.present),
            (AttendanceStatus::Absent.as_str(), self.absent),
        ]
    }

    pub fn total(&self) -> usize {
        self.present + self.absent
    }
}

/// Present/absent head count for one session date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionTally {
    pub date: NaiveDate,
    pub present: usize,
    pub absent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseAnalytic {
    pub course_id: CourseId,
    pub name: String,
    pub attendance_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub total_students: usize,
    pub overall_percentage: f64,
    pub per_course: Vec<CourseAnalytic>,
}

impl AggregateSummary {
    pub fn empty() -> Self {
        Self {
            total_students: 0,
            overall_percentage: 0.0,
            per_course: Vec::new(),
        }
    }
}
