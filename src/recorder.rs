// The recorder owns one MQTT client and one database connection. Each call
// to `run()` polls exactly one network event; publishes on a subscribed
// topic are parsed into a `Reading` and written to the store.
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS, SubscribeFilter,
    SubscribeReasonCode,
};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::mqtt;
use crate::reading::{ParseError, Reading};
use crate::store::Store;

pub struct Recorder {
    client: AsyncClient,
    eventloop: EventLoop,
    store: Store,
    qos: QoS,
    subscriptions: Vec<String>,
    metrics: Metrics,
}

impl Recorder {
    /// Open the database and prepare the broker connection. The broker is
    /// actually dialled on the first `run()`.
    pub fn connect(config: &Config, metrics: Metrics) -> Result<Self> {
        let db = &config.database;
        let store = Store::open(db.path.as_deref(), &db.table, db.write_mode).with_context(|| {
            format!("failed to open database {}", db.path.as_deref().unwrap_or(":memory:"))
        })?;
        info!(
            "Recording into table {} of {} ({:?} mode)",
            db.table,
            db.path.as_deref().unwrap_or(":memory:"),
            store.mode()
        );

        let qos = mqtt::qos(config.mqtt.qos)?;
        Ok(Self::new(mqtt::mqtt_options(&config.mqtt), qos, store, metrics))
    }

    pub fn new(options: MqttOptions, qos: QoS, store: Store, metrics: Metrics) -> Self {
        let (client, eventloop) = AsyncClient::new(options, 10);
        Recorder {
            client,
            eventloop,
            store,
            qos,
            subscriptions: Vec::new(),
            metrics,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Request delivery of `topics` at the recorder's QoS. Nothing is sent
    /// for an empty list.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        if topics.is_empty() {
            warn!("No topics to subscribe to; nothing will be recorded");
            return Ok(());
        }

        let filters = topics.iter().map(|t| SubscribeFilter::new(t.clone(), self.qos));
        self.client
            .subscribe_many(filters)
            .await
            .context("failed to queue subscribe request")?;

        for topic in topics {
            info!("Subscribing to MQTT topic: {} ({:?})", topic, self.qos);
        }
        self.subscriptions.extend(topics.iter().cloned());
        Ok(())
    }

    /// Parse and store one message. A failed write is logged and the message
    /// dropped; only parse errors reach the caller.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Result<(), ParseError> {
        self.metrics.messages_total.inc();
        let reading = Reading::parse(topic, payload)?;

        match self.store.write(&reading) {
            Ok(()) => {
                self.metrics.records_written_total.inc();
                debug!(
                    "Recorded {} = {} at {}",
                    reading.topic, reading.value, reading.timestamp
                );
            }
            Err(e) => {
                self.metrics.write_errors_total.inc();
                error!("Unable to insert data: {:#}", e);
            }
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Incoming::Publish(p)) => {
                if !self.is_subscribed(&p.topic) {
                    debug!("Ignoring message on unsubscribed topic {}", p.topic);
                    return;
                }
                if let Err(e) = self.on_message(&p.topic, &p.payload) {
                    self.metrics.parse_errors_total.inc();
                    warn!("Dropping message on {}: {}", p.topic, e);
                }
            }
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected successfully");
                } else {
                    warn!("Connect returned result code: {:?}", ack.code);
                }
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|c| matches!(c, SubscribeReasonCode::Failure))
                {
                    warn!("Broker rejected a subscription: {:?}", ack.return_codes);
                }
            }
            Event::Incoming(i) => {
                debug!("Incoming = {i:?}");
            }
            Event::Outgoing(o) => {
                debug!("Outgoing = {o:?}");
            }
        }
    }

    /// Process one pending network event. Connection errors are returned.
    pub async fn run(&mut self) -> Result<()> {
        let event = self.eventloop.poll().await.context("MQTT connection error")?;
        self.handle_event(event);
        Ok(())
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|filter| rumqttc::matches(topic, filter))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteMode;
    use chrono::{TimeZone, Utc};
    use rumqttc::{Packet, Publish};

    fn recorder(mode: WriteMode) -> Recorder {
        let store = Store::open(None, "readings", mode).unwrap();
        Recorder::new(
            MqttOptions::new("recorder-test", "localhost", 1883),
            QoS::ExactlyOnce,
            store,
            Metrics::new().unwrap(),
        )
    }

    fn publish(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::ExactlyOnce,
            payload.as_bytes().to_vec(),
        )))
    }

    fn topics(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_well_formed_message_is_recorded() {
        let mut rec = recorder(WriteMode::Insert);
        rec.subscribe(&topics(&["sensors/moisture"])).await.unwrap();

        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#,
        ));

        let rows = rec.store().readings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "moisture");
        assert_eq!(rows[0].timestamp, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(rows[0].value, 12.5);
        assert_eq!(rec.metrics.records_written_total.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_value_is_not_recorded() {
        let mut rec = recorder(WriteMode::Insert);

        let err = rec
            .on_message("sensors/moisture", br#"{"timestamp": "2023-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField("value")));
        assert_eq!(rec.store().count().unwrap(), 0);

        // Through the event path the error is counted and the loop carries on.
        rec.subscribe(&topics(&["sensors/#"])).await.unwrap();
        rec.handle_event(publish("sensors/moisture", r#"{"timestamp": "2023-01-01T00:00:00Z"}"#));
        assert_eq!(rec.metrics.parse_errors_total.get(), 1);
        assert_eq!(rec.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_same_topic_twice_insert_mode() {
        let mut rec = recorder(WriteMode::Insert);
        rec.subscribe(&topics(&["sensors/moisture"])).await.unwrap();

        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#,
        ));
        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:01:00Z", "value": 13.5}"#,
        ));

        let values: Vec<f64> = rec.store().readings().unwrap().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![12.5, 13.5]);
    }

    #[tokio::test]
    async fn test_same_topic_twice_upsert_mode() {
        let mut rec = recorder(WriteMode::Upsert);
        rec.subscribe(&topics(&["sensors/moisture"])).await.unwrap();

        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#,
        ));
        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:01:00Z", "value": 13.5}"#,
        ));

        let rows = rec.store().readings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 13.5);
        assert_eq!(rows[0].timestamp, Utc.with_ymd_and_hms(2023, 1, 1, 0, 1, 0).unwrap());
    }

    #[tokio::test]
    async fn test_empty_topic_list_never_handles_messages() {
        let mut rec = recorder(WriteMode::Insert);
        rec.subscribe(&[]).await.unwrap();

        rec.handle_event(publish(
            "sensors/moisture",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#,
        ));

        assert_eq!(rec.metrics.messages_total.get(), 0);
        assert_eq!(rec.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wildcard_subscription_matches() {
        let mut rec = recorder(WriteMode::Insert);
        rec.subscribe(&topics(&["mock/+"])).await.unwrap();

        rec.handle_event(publish(
            "mock/saturation",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 0.3}"#,
        ));
        rec.handle_event(publish(
            "other/saturation",
            r#"{"timestamp": "2023-01-01T00:00:00Z", "value": 0.9}"#,
        ));

        let rows = rec.store().readings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "saturation");
        assert_eq!(rows[0].value, 0.3);
    }

    #[tokio::test]
    async fn test_write_failure_is_logged_and_loop_continues() {
        let mut rec = recorder(WriteMode::Insert);
        rec.store().connection().execute("DROP TABLE readings", []).unwrap();

        let payload = br#"{"timestamp": "2023-01-01T00:00:00Z", "value": 12.5}"#;
        assert!(rec.on_message("sensors/moisture", payload).is_ok(), "write errors are swallowed");
        assert_eq!(rec.metrics.write_errors_total.get(), 1);
        assert_eq!(rec.metrics.records_written_total.get(), 0);

        // Once the table is back the next message goes through.
        crate::store::create_table(rec.store().connection(), "readings").unwrap();
        assert_eq!(rec.store().count().unwrap(), 0);

        let payload = br#"{"timestamp": "2023-01-01T00:01:00Z", "value": 13.5}"#;
        rec.on_message("sensors/moisture", payload).unwrap();
        let rows = rec.store().readings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 13.5);
        assert_eq!(rec.metrics.write_errors_total.get(), 1);
        assert_eq!(rec.metrics.records_written_total.get(), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_ends_run() {
        let store = Store::open(None, "readings", WriteMode::Insert).unwrap();
        let mut rec = Recorder::new(
            MqttOptions::new("recorder-test", "127.0.0.1", 1),
            QoS::ExactlyOnce,
            store,
            Metrics::new().unwrap(),
        );

        let err = rec.run().await.expect_err("nothing listens on port 1");
        assert!(format!("{:#}", err).contains("MQTT connection error"), "got {:#}", err);
    }
}
