use crate::models::{DeliveryStatus, SeverityBucket};

pub fn severity_bucket(arrears_count: u32) -> SeverityBucket {
    match arrears_count {
        0 => SeverityBucket::None,
        1 => SeverityBucket::Low,
        2..=3 => SeverityBucket::Medium,
        _ => SeverityBucket::Critical,
    }
}

pub fn normalize_status(status: &str) -> DeliveryStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "sent" | "delivered" | "opened" | "read" | "completed" => DeliveryStatus::Delivered,
        "failed" | "error" => DeliveryStatus::Failed,
        _ => DeliveryStatus::Pending,
    }
}

pub fn is_successful_status(status: &str) -> bool {
    normalize_status(status) == DeliveryStatus::Delivered
}

/// Label the backend attaches to notifications, keyed on the student's semester.
pub fn severity_from_semester(semester: Option<i32>) -> &'static str {
    match semester {
        Some(value) if value >= 6 => "Critical",
        Some(value) if value >= 4 => "Medium",
        _ => "Low",
    }
}

pub fn is_high_risk(arrears_count: u32) -> bool {
    severity_bucket(arrears_count) == SeverityBucket::Critical
}
