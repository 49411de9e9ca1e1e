use std::sync::LazyLock;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("prodsearch_search_count", "count of the searches", &["method"])
        .expect("failed to register prodsearch_search_count")
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "prodsearch_search_duration",
        "duration of the per-request search in seconds",
        &["method"]
    )
    .expect("failed to register prodsearch_search_duration")
});

static METRIC_BUILD_BATCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "prodsearch_build_batch_duration",
        "duration of the per-batch index build in seconds",
        &["target"],
        exponential_buckets(0.5, 2., 12).unwrap_or_else(|_| DEFAULT_BUCKETS.to_vec())
    )
    .expect("failed to register prodsearch_build_batch_duration")
});

static METRIC_BUILD_SKIPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "prodsearch_build_skipped",
        "count of the records skipped during index build",
        &["target"]
    )
    .expect("failed to register prodsearch_build_skipped")
});

/// 记录一次搜索及其耗时
pub fn observe_search(method: &str, duration: f32) {
    METRIC_SEARCH_COUNT.with_label_values(&[method]).inc();
    METRIC_SEARCH_DURATION.with_label_values(&[method]).observe(duration as f64);
}

pub fn observe_build_batch(target: &str, duration: f32) {
    METRIC_BUILD_BATCH_DURATION.with_label_values(&[target]).observe(duration as f64);
}

pub fn inc_build_skipped(target: &str) {
    METRIC_BUILD_SKIPPED.with_label_values(&[target]).inc();
}
