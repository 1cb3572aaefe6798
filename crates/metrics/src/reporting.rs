use prometheus::{
    IntCounter,
    IntGauge,
};

pub fn log_counter(counter: &IntCounter, increment: u64) {
    counter.inc_by(increment);
}

pub fn log_gauge(gauge: &IntGauge, value: i64) {
    gauge.set(value);
}
