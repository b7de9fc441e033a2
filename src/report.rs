use std::collections::{BTreeSet, HashSet};
use std::fmt::Write;

use chrono::NaiveDate;
use rust_xlsxwriter::{Format, FormatAlign, Workbook, XlsxError};

use crate::aggregate::RECENT_SESSIONS;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{
    AggregateSummary, AttendanceEvent, Course, SessionTally, Student, WeeklyView, YearMonth,
};

const SHEET_NAME_LIMIT: usize = 31;

/// Monthly roster grid: one row per student, one column per session date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSheet {
    pub title: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One sheet per course. A lone course gets a `<name> Attendance` title,
/// several courses are titled by name alone.
pub fn build_sheets(
    courses: &[Course],
    students: &[Student],
    events: &[AttendanceEvent],
    month: YearMonth,
) -> Vec<ReportSheet> {
    match courses {
        [course] => vec![course_sheet(
            course,
            format!("{} Attendance", course.name),
            students,
            events,
            month,
        )],
        _ => courses
            .iter()
            .map(|course| course_sheet(course, course.name.clone(), students, events, month))
            .collect(),
    }
}

fn course_sheet(
    course: &Course,
    title: String,
    students: &[Student],
    events: &[AttendanceEvent],
    month: YearMonth,
) -> ReportSheet {
    let mut present: HashSet<(&str, NaiveDate)> = HashSet::new();
    let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();

    for event in events
        .iter()
        .filter(|event| event.course_id == course.id && month.contains(event.date))
    {
        dates.insert(event.date);
        if event.is_present() {
            present.insert((event.student_id.as_str(), event.date));
        }
    }

    let mut header = vec!["Roll No".to_string(), "Student Name".to_string()];
    header.extend(dates.iter().map(|date| date.format("%Y-%m-%d").to_string()));

    let mut roster: Vec<&Student> = students
        .iter()
        .filter(|student| student.course_id == course.id)
        .collect();
    roster.sort_by(|a, b| a.roll_no.cmp(&b.roll_no));

    let rows = roster
        .into_iter()
        .map(|student| {
            let mut row = vec![student.roll_no.clone(), student.name.clone()];
            row.extend(dates.iter().map(|date| {
                if present.contains(&(student.id.as_str(), *date)) {
                    "P".to_string()
                } else {
                    "A".to_string()
                }
            }));
            row
        })
        .collect();

    ReportSheet {
        title,
        header,
        rows,
    }
}

pub fn render_xlsx(sheets: &[ReportSheet]) -> AnalyticsResult<Vec<u8>> {
    write_workbook(sheets).map_err(|error| AnalyticsError::Store(format!("xlsx rendering: {error}")))
}

fn write_workbook(sheets: &[ReportSheet]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold().set_align(FormatAlign::Center);
    let mut used_names = HashSet::new();

    for sheet in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(unique_sheet_name(&sheet.title, &mut used_names))?;

        for (col, value) in sheet.header.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, value, &header_format)?;
        }
        for (row_index, row) in sheet.rows.iter().enumerate() {
            for (col, value) in row.iter().enumerate() {
                worksheet.write_string(row_index as u32 + 1, col as u16, value)?;
            }
        }
    }
    if sheets.is_empty() {
        workbook.add_worksheet().set_name("Attendance")?;
    }

    workbook.save_to_buffer()
}

/// Worksheet names are capped at 31 chars and may not contain `[]:*?/\`.
fn sheet_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            other => other,
        })
        .take(SHEET_NAME_LIMIT)
        .collect();
    let trimmed = cleaned.trim().trim_matches('\'');
    if trimmed.is_empty() {
        "Attendance".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Excel compares sheet names case-insensitively; clashes get a ` (n)` suffix.
fn unique_sheet_name(title: &str, used: &mut HashSet<String>) -> String {
    let base = sheet_name(title);
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.to_lowercase()) {
        let suffix = format!(" ({n})");
        let keep = SHEET_NAME_LIMIT - suffix.chars().count();
        candidate = format!("{}{}", base.chars().take(keep).collect::<String>().trim_end(), suffix);
        n += 1;
    }
    candidate
}

pub fn build_summary_markdown(
    scope_label: &str,
    month: YearMonth,
    summary: &AggregateSummary,
    weekly: &WeeklyView,
    sessions: &[SessionTally],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Summary");
    let _ = writeln!(output, "Generated for {} ({})", scope_label, month);
    let _ = writeln!(output);
    let _ = writeln!(output, "- Students: {}", summary.total_students);
    let _ = writeln!(
        output,
        "- Overall attendance: {:.2}% (mean of course percentages)",
        summary.overall_percentage
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Courses");

    if summary.per_course.is_empty() {
        let _ = writeln!(output, "No courses in scope.");
    } else {
        for course in &summary.per_course {
            let _ = writeln!(
                output,
                "- {} ({}): {:.2}%",
                course.name, course.course_id, course.attendance_percentage
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Trend");

    if weekly.is_empty() {
        let _ = writeln!(output, "No attendance recorded.");
    } else {
        for week in weekly {
            let _ = writeln!(
                output,
                "- {} (from {}): {:.2}%",
                week.week_label, week.week_start, week.percentage
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Sessions");

    if sessions.is_empty() {
        let _ = writeln!(output, "No sessions held in {}.", month);
    } else {
        let _ = writeln!(output, "{} sessions held in {}.", sessions.len(), month);
        for tally in sessions.iter().take(RECENT_SESSIONS) {
            let _ = writeln!(
                output,
                "- {}: {} present, {} absent",
                tally.date, tally.present, tally.absent
            );
        }
    }

    output
}
