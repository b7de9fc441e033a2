use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{
    AttendanceEvent, AttendanceStatus, Course, CourseId, EventQuery, Scope, Student, StudentId,
};
use crate::report;
use crate::store::{AttendanceStore, CourseRegistry, ReportRequest, TeacherAssignments};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let courses = vec![
        ("cs101", "Intro to Programming"),
        ("ma201", "Linear Algebra"),
        ("ph110", "Mechanics"),
    ];

    for &(id, name) in &courses {
        sqlx::query(
            r#"
            INSERT INTO attendance_insights.courses (id, name)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, active = TRUE
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    let assignments = vec![("t-okafor", "cs101"), ("t-okafor", "ma201"), ("t-lindqvist", "ph110")];

    for (teacher_id, course_id) in assignments {
        sqlx::query(
            r#"
            INSERT INTO attendance_insights.teacher_courses (teacher_id, course_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(teacher_id)
        .bind(course_id)
        .execute(pool)
        .await?;
    }

    let students = vec![
        ("R-1001", "Amara Njoroge", "cs101"),
        ("R-1002", "Tomas Varga", "cs101"),
        ("R-1003", "Priya Raman", "cs101"),
        ("R-2001", "Lena Hoffmann", "ma201"),
        ("R-2002", "Kwame Asante", "ma201"),
        ("R-3001", "Sofia Marquez", "ph110"),
    ];

    let first_session = NaiveDate::from_ymd_opt(2024, 4, 1).context("invalid date")?;
    let mut marked = 0usize;

    for (index, (roll_no, name, course_id)) in students.into_iter().enumerate() {
        let student_id = upsert_student(pool, roll_no, name, course_id, None).await?;

        for offset in 0..61 {
            let date = first_session + Duration::days(offset);
            if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            let status = if (offset as usize + index * 3) % 5 == 0 {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            };
            upsert_attendance(pool, &student_id, course_id, date, status).await?;
            marked += 1;
        }
    }

    info!(marked, "seeded attendance marks");
    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        roll_no: String,
        name: String,
        course_id: String,
        date: NaiveDate,
        status: String,
        student_id: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut written = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed CSV record {}", line + 1))?;
        let status: AttendanceStatus = row
            .status
            .parse()
            .with_context(|| format!("CSV record {}", line + 1))?;
        let student_id = upsert_student(
            pool,
            &row.roll_no,
            &row.name,
            &row.course_id,
            row.student_id.as_deref(),
        )
        .await?;

        if upsert_attendance(pool, &student_id, &row.course_id, row.date, status).await? {
            written += 1;
        }
    }

    Ok(written)
}

async fn upsert_student(
    pool: &PgPool,
    roll_no: &str,
    name: &str,
    course_id: &str,
    student_id: Option<&str>,
) -> anyhow::Result<String> {
    let candidate = student_id
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let id: String = sqlx::query(
        r#"
        INSERT INTO attendance_insights.students (id, name, roll_no, course_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (roll_no) DO UPDATE
        SET name = EXCLUDED.name, course_id = EXCLUDED.course_id
        RETURNING id
        "#,
    )
    .bind(candidate)
    .bind(name)
    .bind(roll_no)
    .bind(course_id)
    .fetch_one(pool)
    .await?
    .get("id");

    Ok(id)
}

async fn upsert_attendance(
    pool: &PgPool,
    student_id: &str,
    course_id: &str,
    date: NaiveDate,
    status: AttendanceStatus,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO attendance_insights.attendance (student_id, course_id, date, status)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (student_id, course_id, date) DO UPDATE
        SET status = EXCLUDED.status
        WHERE attendance.status IS DISTINCT FROM EXCLUDED.status
        "#,
    )
    .bind(student_id)
    .bind(course_id)
    .bind(date)
    .bind(status.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn course_id_strings(ids: &BTreeSet<CourseId>) -> Vec<String> {
    ids.iter().map(|id| id.0.clone()).collect()
}

fn student_from_row(row: &PgRow) -> Student {
    Student {
        id: StudentId(row.get("id")),
        name: row.get("name"),
        roll_no: row.get("roll_no"),
        course_id: CourseId(row.get("course_id")),
    }
}

#[async_trait]
impl CourseRegistry for PgStore {
    async fn list_courses(&self) -> AnalyticsResult<Vec<Course>> {
        let rows = sqlx::query(
            "SELECT id, name FROM attendance_insights.courses WHERE active ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Course {
                id: CourseId(row.get("id")),
                name: row.get("name"),
            })
            .collect())
    }
}

#[async_trait]
impl TeacherAssignments for PgStore {
    async fn assigned_courses(&self, teacher_id: &str) -> AnalyticsResult<BTreeSet<CourseId>> {
        let rows = sqlx::query(
            "SELECT course_id FROM attendance_insights.teacher_courses WHERE teacher_id = $1",
        )
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| CourseId(row.get("course_id"))).collect())
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn list_students(&self, scope: &Scope) -> AnalyticsResult<Vec<Student>> {
        let rows = match scope {
            Scope::Courses { course_ids } => {
                sqlx::query(
                    "SELECT id, name, roll_no, course_id FROM attendance_insights.students \
                     WHERE course_id = ANY($1) ORDER BY roll_no",
                )
                .bind(course_id_strings(course_ids))
                .fetch_all(&self.pool)
                .await?
            }
            Scope::Student { student_id, .. } => {
                sqlx::query(
                    "SELECT id, name, roll_no, course_id FROM attendance_insights.students \
                     WHERE id = $1",
                )
                .bind(student_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(student_from_row).collect())
    }

    async fn find_student(&self, id: &StudentId) -> AnalyticsResult<Option<Student>> {
        let row = sqlx::query(
            "SELECT id, name, roll_no, course_id FROM attendance_insights.students WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(student_from_row))
    }

    async fn query_events(&self, query: &EventQuery) -> AnalyticsResult<Vec<AttendanceEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, course_id, date, status
            FROM attendance_insights.attendance
            WHERE ($1::text IS NULL OR student_id = $1)
              AND ($2::text[] IS NULL OR course_id = ANY($2))
              AND ($3::date IS NULL OR date >= $3)
              AND ($4::date IS NULL OR date <= $4)
            ORDER BY date, course_id, student_id
            "#,
        )
        .bind(query.student_id.as_ref().map(|id| id.0.clone()))
        .bind(query.course_ids.as_ref().map(course_id_strings))
        .bind(query.date_range.map(|range| range.start))
        .bind(query.date_range.map(|range| range.end))
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            events.push(AttendanceEvent {
                student_id: StudentId(row.get("student_id")),
                course_id: CourseId(row.get("course_id")),
                date: row.get("date"),
                status: status.parse()?,
            });
        }

        debug!(rows = events.len(), "fetched attendance events");
        Ok(events)
    }

    async fn request_report(&self, request: &ReportRequest) -> AnalyticsResult<Vec<u8>> {
        let courses: Vec<Course> = self
            .list_courses()
            .await?
            .into_iter()
            .filter(|course| request.course_ids.contains(&course.id))
            .collect();
        if courses.is_empty() {
            return Err(AnalyticsError::NotFound(format!(
                "no active course among {:?}",
                course_id_strings(&request.course_ids)
            )));
        }

        let scope = Scope::Courses {
            course_ids: request.course_ids.clone(),
        };
        let students = self.list_students(&scope).await?;
        let events = self
            .query_events(&scope.event_query(Some(request.month.date_range())))
            .await?;

        let sheets = report::build_sheets(&courses, &students, &events, request.month);
        report::render_xlsx(&sheets)
    }
}
