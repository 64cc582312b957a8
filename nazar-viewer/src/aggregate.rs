use std::collections::HashSet;

use nazar_proto::MetricRecord;

/// Latest record per host, given records in newest-first order.
///
/// The first occurrence of a host wins, so the output lists hosts by recency
/// of their latest update, most recent first.
pub fn latest_per_host<'a, I>(records: I) -> Vec<&'a MetricRecord>
where
    I: IntoIterator<Item = &'a MetricRecord>,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|&record| seen.insert(record.host.as_str()))
        .collect()
}
