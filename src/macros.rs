//! Internal macros

/// Time `$body` and record the elapsed seconds in `$histogram`
/// under `$labels`. Evaluates to whatever `$body` evaluates to.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}
