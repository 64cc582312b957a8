use nazar_proto::MetricRecord;
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::well_known::{Iso8601, Rfc3339},
    macros::format_description,
};

use crate::view::ViewModel;

/// Readings above this are flagged. Display only, nothing is rejected.
pub const HIGH_THRESHOLD: f64 = 80.0;

/// `12.3%`, or `-` when there is no reading. Never renders an absent value as zero.
pub fn reading(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v:.1}{unit}"),
        None => "-".to_owned(),
    }
}

pub fn is_high(value: Option<f64>) -> bool {
    value.is_some_and(|v| v > HIGH_THRESHOLD)
}

/// Wall-clock time of a record in `offset`. Falls back to the raw string.
pub fn clock_time(timestamp: &str, offset: UtcOffset) -> String {
    let parsed = OffsetDateTime::parse(timestamp, &Rfc3339)
        .or_else(|_| PrimitiveDateTime::parse(timestamp, &Iso8601::DEFAULT).map(|t| t.assume_utc()));

    parsed
        .ok()
        .and_then(|t| {
            t.to_offset(offset)
                .format(format_description!("[hour]:[minute]:[second]"))
                .ok()
        })
        .unwrap_or_else(|| timestamp.to_owned())
}

fn gauge(label: &str, value: Option<f64>) -> String {
    let mut out = format!("{label} {}", reading(value, "%"));
    if is_high(value) {
        out.push_str(" HIGH");
    }
    out
}

fn host_line(record: &MetricRecord, offset: UtcOffset) -> String {
    format!(
        "  {:<20} {}  {} | {} | {}",
        record.host,
        clock_time(&record.timestamp, offset),
        gauge("CPU", record.cpu_percent),
        gauge("Memory", record.memory_percent),
        gauge("Disk", record.disk_percent),
    )
}

fn activity_line(record: &MetricRecord, offset: UtcOffset) -> String {
    format!(
        "  {:<20} CPU: {} | Mem: {}  {}",
        record.host,
        reading(record.cpu_percent, "%"),
        reading(record.memory_percent, "%"),
        clock_time(&record.timestamp, offset),
    )
}

/// Plain-text rendering of the whole view.
pub fn render(view: &ViewModel, offset: UtcOffset) -> String {
    let status = if view.connected { "Live" } else { "Disconnected" };
    let mut lines = vec![format!("Nazar Dashboard [{status}]")];
    if let Some(error) = &view.error {
        lines.push(format!("! {error}"));
    }

    let hosts = view.hosts();
    lines.push(format!("\nMonitored Hosts ({})", hosts.len()));
    if hosts.is_empty() {
        lines.push("  Waiting for metrics...".to_owned());
    }
    lines.extend(hosts.into_iter().map(|record| host_line(record, offset)));

    lines.push(format!("\nRecent Activity ({} buffered)", view.records.len()));
    lines.extend(view.recent_activity().map(|record| activity_line(record, offset)));

    lines.push(String::new());
    lines.join("\n")
}
