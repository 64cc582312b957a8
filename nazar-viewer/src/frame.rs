use nazar_proto::{InvalidRecord, MetricRecord};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed metric record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid metric record: {0}")]
    Invalid(#[from] InvalidRecord),
    #[error("record for host {0:?} outside the session filter")]
    OtherHost(String),
}

/// Decode one frame payload into a record, applying the session's host filter.
pub fn decode_frame(data: &str, filter: Option<&str>) -> Result<MetricRecord, FrameError> {
    let record: MetricRecord = serde_json::from_str(data)?;
    record.validate()?;

    match filter {
        Some(host) if record.host != host => Err(FrameError::OtherHost(record.host)),
        _ => Ok(record),
    }
}
