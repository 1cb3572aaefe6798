use metrics::register_meridian_counter;

register_meridian_counter!(pub RETRY_EXHAUSTED_TOTAL, "Count of exhausted retry budgets");
register_meridian_counter!(
    pub STALE_SAFEPOINT_REJECTION_TOTAL,
    "Count of reads rejected because the cached safepoint was stale"
);
register_meridian_counter!(
    pub BELOW_SAFEPOINT_REJECTION_TOTAL,
    "Count of reads rejected for starting at or below the safepoint"
);
