use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::node::{Node, NodeError, NodeInit, Responder};

pub const KIND: &str = "ticker";

const DEFAULT_INTERVAL_MS: u64 = 1000;
const MIN_INTERVAL_MS: u64 = 10;

/// Publishes a `tick` event with a running counter while started.
///
/// Config: `{"interval_ms": u64}` (default 1000, minimum 10). Commands:
/// `interval` (number of ms) changes the period, `count` reports the counter.
pub struct TickerNode {
    id: String,
    responder: Responder,
    interval: Duration,
    count: Arc<AtomicU64>,
    timer: Option<JoinHandle<()>>,
}

impl TickerNode {
    /// Factory entry point.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidArgument`] for an unusable `interval_ms`.
    pub async fn build(init: NodeInit) -> Result<Box<dyn Node>, NodeError> {
        let interval = match init.config.get("interval_ms") {
            None | Some(Value::Null) => Duration::from_millis(DEFAULT_INTERVAL_MS),
            Some(value) => parse_interval(value)?,
        };
        Ok(Box::new(Self {
            id: init.id,
            responder: init.responder,
            interval,
            count: Arc::new(AtomicU64::new(0)),
            timer: None,
        }))
    }

    fn spawn_timer(&mut self) {
        let responder = self.responder.clone();
        let count = Arc::clone(&self.count);
        let period = self.interval;
        self.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let n = count.fetch_add(1, Ordering::Relaxed) + 1;
                responder.event("tick", json!({ "count": n }));
            }
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn parse_interval(value: &Value) -> Result<Duration, NodeError> {
    match value.as_u64() {
        Some(ms) if ms >= MIN_INTERVAL_MS => Ok(Duration::from_millis(ms)),
        _ => Err(NodeError::InvalidArgument(format!(
            "interval must be an integer >= {MIN_INTERVAL_MS} ms"
        ))),
    }
}

#[async_trait]
impl Node for TickerNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        KIND
    }

    #[allow(clippy::cast_possible_truncation)]
    fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "type": KIND,
            "interval_ms": self.interval.as_millis() as u64,
        })
    }

    async fn on_start(&mut self) -> Result<(), NodeError> {
        self.cancel_timer();
        self.spawn_timer();
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn on_control(&mut self, command: &str, data: &Value) -> Result<(), NodeError> {
        match command {
            "interval" => {
                self.interval = parse_interval(data)?;
                if self.timer.is_some() {
                    self.cancel_timer();
                    self.spawn_timer();
                }
                self.responder
                    .ok(command, json!({ "interval_ms": self.interval.as_millis() as u64 }));
                Ok(())
            }
            "count" => {
                self.responder
                    .ok(command, json!(self.count.load(Ordering::Relaxed)));
                Ok(())
            }
            other => Err(NodeError::NotSupported(format!("unknown command `{other}`"))),
        }
    }

    async fn on_stop(&mut self) -> Result<(), NodeError> {
        self.cancel_timer();
        Ok(())
    }

    async fn on_destroy(&mut self) -> Result<(), NodeError> {
        self.cancel_timer();
        Ok(())
    }
}

impl Drop for TickerNode {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use nodewire_core::{MessageKind, Status};

    use super::*;
    use crate::node::testing::CaptureSink;

    async fn ticker(config: Value) -> (Box<dyn Node>, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        let init = NodeInit {
            id: "t".to_string(),
            config,
            responder: Responder::new("t", sink.clone()),
        };
        (TickerNode::build(init).await.unwrap(), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_only_while_started() {
        let (mut node, sink) = ticker(json!({"interval_ms": 100})).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sink.take().is_empty());

        node.on_start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let ticks = sink.take();
        assert_eq!(ticks.len(), 3);
        assert!(ticks.iter().all(|(_, r)| r.kind == MessageKind::Event && r.name == "tick"));
        assert_eq!(ticks[2].1.data, json!({"count": 3}));

        node.on_stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn interval_command_validates() {
        let (mut node, sink) = ticker(json!({})).await;
        let err = node.on_control("interval", &json!(1)).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        node.on_control("interval", &json!(250)).await.unwrap();
        assert_eq!(node.describe()["interval_ms"], json!(250));
        assert_eq!(sink.take()[0].1.data, json!({"interval_ms": 250}));
    }

    #[tokio::test]
    async fn unknown_command_is_not_supported() {
        let (mut node, _sink) = ticker(json!({})).await;
        let err = node.on_control("explode", &Value::Null).await.unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
    }

    #[tokio::test]
    async fn bad_config_fails_construction() {
        let sink = Arc::new(CaptureSink::default());
        let init = NodeInit {
            id: "t".to_string(),
            config: json!({"interval_ms": "fast"}),
            responder: Responder::new("t", sink),
        };
        assert!(matches!(
            TickerNode::build(init).await,
            Err(NodeError::InvalidArgument(_))
        ));
    }
}
