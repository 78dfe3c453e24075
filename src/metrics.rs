use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, TextEncoder, register_counter, register_histogram};


lazy_static! {
    pub static ref ADMISSIONS_ACCEPTED: Counter =
        register_counter!("like_admissions_accepted_total", "Likes admitted by the rate limiter").unwrap();
    pub static ref ADMISSIONS_REJECTED: Counter =
        register_counter!("like_admissions_rejected_total", "Likes rejected by the rate limiter").unwrap();
    pub static ref OBSERVATIONS_RECORDED: Counter =
        register_counter!("like_cache_observations_total", "New likes folded into the cache").unwrap();
    pub static ref VALUE_CHANGES: Counter =
        register_counter!("like_cache_value_changes_total", "Like value edits folded into the cache").unwrap();
    pub static ref REBUILDS: Counter =
        register_counter!("like_cache_rebuilds_total", "Completed cache rebuilds").unwrap();
    pub static ref REBUILT_RECORDS: Counter =
        register_counter!("like_cache_rebuilt_records_total", "Records written by rebuilds").unwrap();
    pub static ref LIST_HITS: Counter =
        register_counter!("like_cache_list_hits_total", "Ids found by list").unwrap();
    pub static ref LIST_MISSES: Counter =
        register_counter!("like_cache_list_misses_total", "Ids missing from the cache on list").unwrap();
    pub static ref UPDATE_LATENCY: Histogram = register_histogram!(
        "like_cache_update_latency_seconds",
        "Incremental update latency in seconds, queueing included"
    )
    .unwrap();
}

// Text exposition of everything registered above
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
