/// Register an integer counter with the process metrics registry and store it
/// in a static variable. The reported metric name is the lower_snake_case
/// version of the declared variable name.
#[macro_export]
macro_rules! register_meridian_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                #[allow(clippy::disallowed_macros)]
                $crate::prometheus::register_int_counter_with_registry!(
                    name,
                    $HELP,
                    &*$crate::MERIDIAN_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register an integer gauge with the process metrics registry and store it
/// in a static variable. The reported metric name is the lower_snake_case
/// version of the declared variable name.
#[macro_export]
macro_rules! register_meridian_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntGauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = stringify!([<$NAME:lower>]);
                }
                #[allow(clippy::disallowed_macros)]
                $crate::prometheus::register_int_gauge_with_registry!(
                    name,
                    $HELP,
                    &*$crate::MERIDIAN_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}
