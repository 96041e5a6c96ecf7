use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
pub struct Student {
    pub id: i64,
    pub roll_no: String,
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub semester: Option<i32>,
    #[serde(default)]
    pub arrears_count: Option<u32>,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default)]
    pub parent_email: Option<String>,
    #[serde(default)]
    pub parent_phone: Option<String>,
}

impl Student {
    pub fn arrears(&self) -> u32 {
        self.arrears_count.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub student_id: Option<i64>,
    #[serde(default)]
    pub student_name: Option<String>,
    pub message: String,
    #[serde(default = "default_notification_status")]
    pub status: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub sent_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
}

/// Manual outreach (call/chat/email) recorded against a student.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertAction {
    pub channel: String,
    #[serde(default)]
    pub recipient: Option<String>,
    pub message: String,
    #[serde(default = "default_action_status")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub sent_at: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
}

/// Payload of `GET /api/students/{roll_no}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StudentProfile {
    pub student: Student,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default, rename = "alertActions")]
    pub alert_actions: Vec<AlertAction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub ok: bool,
    pub db_connected: bool,
    pub mode: String,
    #[serde(default)]
    pub db_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    Pending,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeliveryStatus::Delivered => "Delivered",
            DeliveryStatus::Failed => "Failed",
            DeliveryStatus::Pending => "Pending",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeverityBucket {
    None,
    Low,
    Medium,
    Critical,
}

impl SeverityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityBucket::None => "none",
            SeverityBucket::Low => "low",
            SeverityBucket::Medium => "medium",
            SeverityBucket::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn record(&mut self, bucket: SeverityBucket) {
        match bucket {
            SeverityBucket::Critical => self.critical += 1,
            SeverityBucket::Medium => self.medium += 1,
            SeverityBucket::Low => self.low += 1,
            SeverityBucket::None => {}
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.medium + self.low
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartmentSummary {
    pub department: String,
    pub counts: SeverityCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyTrend {
    pub month_start: NaiveDate,
    pub alerts: usize,
    pub responses: usize,
}

fn default_notification_status() -> String {
    "pending".to_string()
}

fn default_action_status() -> String {
    "queued".to_string()
}

/// Parses RFC 3339 or naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` timestamps.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.naive_utc());
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}
