use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::models::{
    DepartmentSummary, MonthlyTrend, Notification, SeverityCounts, Student, StudentProfile,
};
use crate::severity;

const TREND_MONTHS: u32 = 6;

pub fn severity_distribution(students: &[Student]) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for student in students {
        counts.record(severity::severity_bucket(student.arrears()));
    }
    counts
}

pub fn summarize_by_department(students: &[Student]) -> Vec<DepartmentSummary> {
    let mut map: BTreeMap<String, SeverityCounts> = BTreeMap::new();

    for student in students {
        let department = student
            .department
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("Unknown");
        map.entry(department.to_string())
            .or_default()
            .record(severity::severity_bucket(student.arrears()));
    }

    map.into_iter()
        .map(|(department, counts)| DepartmentSummary { department, counts })
        .collect()
}

/// Alert and response counts for the six months ending at `today`'s month.
pub fn monthly_trend(notifications: &[Notification], today: NaiveDate) -> Vec<MonthlyTrend> {
    let mut trend: Vec<MonthlyTrend> = (0..TREND_MONTHS)
        .rev()
        .filter_map(|back| month_start(today, back))
        .map(|month_start| MonthlyTrend {
            month_start,
            alerts: 0,
            responses: 0,
        })
        .collect();

    for notification in notifications {
        let Some(created_at) = notification.created_at else {
            continue;
        };
        let key = (created_at.year(), created_at.month());
        let Some(row) = trend
            .iter_mut()
            .find(|row| (row.month_start.year(), row.month_start.month()) == key)
        else {
            continue;
        };

        row.alerts += 1;
        if severity::is_successful_status(&notification.status) {
            row.responses += 1;
        }
    }

    trend
}

pub fn average_arrears(students: &[Student]) -> f64 {
    if students.is_empty() {
        return 0.0;
    }
    let total: u64 = students.iter().map(|s| u64::from(s.arrears())).sum();
    total as f64 / students.len() as f64
}

pub fn delivery_success_rate(notifications: &[Notification]) -> u32 {
    let delivered = notifications
        .iter()
        .filter(|n| severity::is_successful_status(&n.status))
        .count();
    percent(delivered, notifications.len())
}

pub fn high_risk_count(students: &[Student]) -> usize {
    students
        .iter()
        .filter(|s| severity::is_high_risk(s.arrears()))
        .count()
}

fn percent(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        0
    } else {
        (part as f64 / whole as f64 * 100.0).round() as u32
    }
}

fn month_start(today: NaiveDate, months_back: u32) -> Option<NaiveDate> {
    let index = today.year() * 12 + today.month0() as i32 - months_back as i32;
    NaiveDate::from_ymd_opt(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

pub fn build_report(
    source: &str,
    today: NaiveDate,
    students: &[Student],
    notifications: &[Notification],
) -> String {
    let distribution = severity_distribution(students);
    let departments = summarize_by_department(students);
    let trend = monthly_trend(notifications, today);
    let high_risk = high_risk_count(students);

    let mut output = String::new();

    let _ = writeln!(output, "# Arrear Analytics Report");
    let _ = writeln!(output, "Generated from {} on {}", source, today);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");
    let _ = writeln!(output, "- Students tracked: {}", students.len());
    let _ = writeln!(output, "- Average arrears: {:.2}", average_arrears(students));
    let _ = writeln!(
        output,
        "- High-risk students: {} ({}%)",
        high_risk,
        percent(high_risk, students.len())
    );
    let _ = writeln!(
        output,
        "- Notification success rate: {}% of {} notifications",
        delivery_success_rate(notifications),
        notifications.len()
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Severity Distribution");
    if distribution.total() == 0 {
        let _ = writeln!(output, "No students with arrears.");
    } else {
        let _ = writeln!(output, "- Critical: {}", distribution.critical);
        let _ = writeln!(output, "- Medium: {}", distribution.medium);
        let _ = writeln!(output, "- Low: {}", distribution.low);
        let _ = writeln!(
            output,
            "Critical cases account for {}% of total arrears.",
            percent(distribution.critical, distribution.total())
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Departments");
    if departments.is_empty() {
        let _ = writeln!(output, "No students recorded.");
    } else {
        let _ = writeln!(output, "| Department | Critical | Medium | Low |");
        let _ = writeln!(output, "|---|---|---|---|");
        for summary in departments.iter() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                summary.department, summary.counts.critical, summary.counts.medium, summary.counts.low
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alert Trend");
    for row in trend.iter() {
        let _ = writeln!(
            output,
            "- {}: {} alerts, {} responses",
            row.month_start.format("%b %Y"),
            row.alerts,
            row.responses
        );
    }

    let semesters: HashMap<i64, Option<i32>> =
        students.iter().map(|s| (s.id, s.semester)).collect();
    let mut recent = notifications.to_vec();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Notifications");
    if recent.is_empty() {
        let _ = writeln!(output, "No notifications recorded.");
    } else {
        for notification in recent.iter().take(5) {
            let severity = notification.severity.clone().unwrap_or_else(|| {
                let semester = notification
                    .student_id
                    .and_then(|id| semesters.get(&id).copied().flatten());
                severity::severity_from_semester(semester).to_string()
            });
            let _ = writeln!(
                output,
                "- {} [{} / {}]: {}",
                notification.student_name.as_deref().unwrap_or("Unknown"),
                severity,
                severity::normalize_status(&notification.status),
                notification.message
            );
        }
    }

    output
}

fn day_label(timestamp: Option<NaiveDateTime>) -> String {
    timestamp
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string())
}

/// Plain-text view of one student for the `student` command.
pub fn render_profile(profile: &StudentProfile) -> String {
    let student = &profile.student;
    let arrears = student.arrears();
    let mut output = String::new();

    let _ = writeln!(output, "{} ({})", student.name, student.roll_no);
    let _ = writeln!(
        output,
        "Department: {}  Semester: {}",
        student.department.as_deref().unwrap_or("Unknown"),
        student
            .semester
            .map(|semester| semester.to_string())
            .unwrap_or_else(|| "-".to_string())
    );

    let contacts: Vec<&str> = [student.parent_phone.as_deref(), student.parent_email.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if let Some(parent) = student.parent_name.as_deref() {
        if contacts.is_empty() {
            let _ = writeln!(output, "Parent: {}", parent);
        } else {
            let _ = writeln!(output, "Parent: {} ({})", parent, contacts.join(", "));
        }
    } else if !contacts.is_empty() {
        let _ = writeln!(output, "Parent: {}", contacts.join(", "));
    }

    let _ = writeln!(
        output,
        "Arrears: {} ({})",
        arrears,
        severity::severity_bucket(arrears).as_str()
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "Recent notifications:");
    if profile.notifications.is_empty() {
        let _ = writeln!(output, "No notifications sent.");
    } else {
        for notification in profile.notifications.iter() {
            let _ = writeln!(
                output,
                "- {} [{}]: {}",
                day_label(notification.sent_at.or(notification.created_at)),
                severity::normalize_status(&notification.status),
                notification.message
            );
        }
    }

    let mut actions: Vec<_> = profile.alert_actions.iter().collect();
    actions.sort_by(|a, b| b.sent_at.or(b.created_at).cmp(&a.sent_at.or(a.created_at)));

    let _ = writeln!(output);
    let _ = writeln!(output, "Outreach:");
    if actions.is_empty() {
        let _ = writeln!(output, "No outreach recorded.");
    } else {
        for action in actions {
            let _ = writeln!(
                output,
                "- {} {} to {} ({}): {}",
                day_label(action.sent_at.or(action.created_at)),
                action.channel,
                action.recipient.as_deref().unwrap_or("parent"),
                action.status,
                action.message
            );
        }
    }

    output
}
