// Prometheus counters for the ingest loop. `IntCounter` is a cheap handle
// around shared state, so the recorder and the HTTP handler see the same
// values.
use prometheus::{IntCounter, Registry};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub messages_total: IntCounter,
    pub records_written_total: IntCounter,
    pub write_errors_total: IntCounter,
    pub parse_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let messages_total =
            IntCounter::new("mqtt_messages_total", "Total MQTT messages received")?;
        let records_written_total =
            IntCounter::new("records_written_total", "Readings written to the database")?;
        let write_errors_total =
            IntCounter::new("write_errors_total", "Readings dropped by a failed database write")?;
        let parse_errors_total =
            IntCounter::new("parse_errors_total", "Messages dropped by a payload parse error")?;

        for counter in [
            &messages_total,
            &records_written_total,
            &write_errors_total,
            &parse_errors_total,
        ] {
            registry.register(Box::new(counter.clone()))?;
        }

        Ok(Metrics {
            registry,
            messages_total,
            records_written_total,
            write_errors_total,
            parse_errors_total,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.messages_total.inc();

        assert_eq!(metrics.registry.gather().len(), 4);

        // Clones share the same underlying counter.
        let handle = metrics.clone();
        handle.messages_total.inc();
        assert_eq!(metrics.messages_total.get(), 2);
    }
}
