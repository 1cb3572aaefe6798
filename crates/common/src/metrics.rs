use metrics::{
    log_counter,
    register_meridian_counter,
};

register_meridian_counter!(ERRORS_REPORTED_TOTAL, "Count of errors reported");

pub fn log_errors_reported_total() {
    log_counter(&ERRORS_REPORTED_TOTAL, 1);
}
