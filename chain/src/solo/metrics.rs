use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Actor].
pub struct Metrics {
    /// Highest executed height
    pub chained_height: Gauge,
    /// Number of blocks produced
    pub produced: Counter,
    /// Number of failed production attempts
    pub produce_failures: Counter,
    /// Number of blocks the store failed to process
    pub store_failures: Counter,
    /// Number of blocks delivered at or below the chained height
    pub stale: Counter,
    /// Number of cross-shard envelopes broadcast
    pub envelopes: Counter,
    /// Number of heights whose cross-shard messages could not be dispatched
    pub dispatch_failures: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let chained_height = Gauge::default();
        context.register(
            "chained_height",
            "Highest executed height",
            chained_height.clone(),
        );
        let produced = Counter::default();
        context.register("produced", "Number of blocks produced", produced.clone());
        let produce_failures = Counter::default();
        context.register(
            "produce_failures",
            "Number of failed production attempts",
            produce_failures.clone(),
        );
        let store_failures = Counter::default();
        context.register(
            "store_failures",
            "Number of blocks the store failed to process",
            store_failures.clone(),
        );
        let stale = Counter::default();
        context.register(
            "stale",
            "Number of blocks delivered at or below the chained height",
            stale.clone(),
        );
        let envelopes = Counter::default();
        context.register(
            "envelopes",
            "Number of cross-shard envelopes broadcast",
            envelopes.clone(),
        );
        let dispatch_failures = Counter::default();
        context.register(
            "dispatch_failures",
            "Number of heights whose cross-shard messages could not be dispatched",
            dispatch_failures.clone(),
        );
        Self {
            chained_height,
            produced,
            produce_failures,
            store_failures,
            stale,
            envelopes,
            dispatch_failures,
        }
    }
}
