use metrics::{
    log_counter,
    log_gauge,
    register_meridian_counter,
    register_meridian_gauge,
};

register_meridian_counter!(
    pub STORES_OPENED_TOTAL,
    "Count of cluster store handles constructed",
);
register_meridian_counter!(
    pub STORE_OPENS_DEDUPLICATED_TOTAL,
    "Count of store opens that returned an existing handle",
);
register_meridian_counter!(
    pub TIMESTAMPS_ACQUIRED_TOTAL,
    "Count of timestamps acquired from the timestamp service",
);
register_meridian_counter!(
    pub TRANSACTIONS_BEGUN_TOTAL,
    "Count of transactions begun",
);
register_meridian_counter!(
    pub TRANSACTIONS_COMMITTED_TOTAL,
    "Count of transactions committed",
);
register_meridian_counter!(
    pub SNAPSHOTS_CREATED_TOTAL,
    "Count of read snapshots created",
);
register_meridian_counter!(
    pub DISPATCH_OK_TOTAL,
    "Count of dispatched requests that completed successfully",
);
register_meridian_counter!(
    pub ROUTE_CACHE_HITS_TOTAL,
    "Count of route lookups served from the cache",
);
register_meridian_counter!(
    pub ROUTE_CACHE_MISSES_TOTAL,
    "Count of route lookups resolved against the placement service",
);
register_meridian_counter!(
    pub RETRIES_TOTAL,
    "Count of retried failures across all failure kinds",
);
register_meridian_counter!(
    pub RETRIES_EXHAUSTED_TOTAL,
    "Count of operations that exhausted their retry budget or deadline",
);
register_meridian_counter!(
    pub SAFEPOINT_REFRESH_OK_TOTAL,
    "Count of successful safepoint refreshes",
);
register_meridian_counter!(
    pub SAFEPOINT_REFRESH_FAILED_TOTAL,
    "Count of failed safepoint refresh attempts",
);
register_meridian_counter!(
    pub STALE_SAFEPOINT_REJECTIONS_TOTAL,
    "Count of visibility checks rejected for safepoint staleness",
);
register_meridian_counter!(
    pub GC_TRIGGER_OK_TOTAL,
    "Count of successfully persisted safepoint candidates",
);
register_meridian_counter!(
    pub GC_TRIGGER_FAILED_TOTAL,
    "Count of failed safepoint candidate updates",
);
register_meridian_gauge!(
    pub SAFEPOINT_CURRENT,
    "Most recently cached garbage collection safepoint",
);

pub fn log_store_opened(deduplicated: bool) {
    if deduplicated {
        log_counter(&STORE_OPENS_DEDUPLICATED_TOTAL, 1);
    } else {
        log_counter(&STORES_OPENED_TOTAL, 1);
    }
}

pub fn log_timestamp_acquired() {
    log_counter(&TIMESTAMPS_ACQUIRED_TOTAL, 1);
}

pub fn log_transaction_begun() {
    log_counter(&TRANSACTIONS_BEGUN_TOTAL, 1);
}

pub fn log_transaction_committed() {
    log_counter(&TRANSACTIONS_COMMITTED_TOTAL, 1);
}

pub fn log_snapshot_created() {
    log_counter(&SNAPSHOTS_CREATED_TOTAL, 1);
}

pub fn log_dispatch_ok() {
    log_counter(&DISPATCH_OK_TOTAL, 1);
}

pub fn log_route_cache_hit() {
    log_counter(&ROUTE_CACHE_HITS_TOTAL, 1);
}

pub fn log_route_cache_miss() {
    log_counter(&ROUTE_CACHE_MISSES_TOTAL, 1);
}

pub fn log_retry() {
    log_counter(&RETRIES_TOTAL, 1);
}

pub fn log_retry_exhausted() {
    log_counter(&RETRIES_EXHAUSTED_TOTAL, 1);
}

pub fn log_safepoint_refresh(success: bool) {
    if success {
        log_counter(&SAFEPOINT_REFRESH_OK_TOTAL, 1);
    } else {
        log_counter(&SAFEPOINT_REFRESH_FAILED_TOTAL, 1);
    }
}

pub fn log_stale_safepoint_rejection() {
    log_counter(&STALE_SAFEPOINT_REJECTIONS_TOTAL, 1);
}

pub fn log_safepoint(value: u64) {
    log_gauge(&SAFEPOINT_CURRENT, value as i64);
}

pub fn log_gc_trigger(success: bool) {
    if success {
        log_counter(&GC_TRIGGER_OK_TOTAL, 1);
    } else {
        log_counter(&GC_TRIGGER_FAILED_TOTAL, 1);
    }
}
