//! Fire-and-forget HTTP push hooks.
//!
//! Events are JSON-POSTed by a bounded worker pool; enqueueing never
//! blocks and overflow is dropped silently. The dispatcher is a value
//! owned by the enclosing service; its workers stop when the supplied
//! cancellation token fires.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel; overflow drops.
pub const HOOK_EVENT_QUEUE_LEN: usize = 10_000;
/// Number of delivery workers.
pub const HOOK_EVENT_WORKER_NUM: usize = 20;

/// One outbound hook call.
#[derive(Debug)]
pub struct HookEvent {
    pub url: String,
    pub data: serde_json::Value,
}

/// Payload reported for TS segment lifecycle hooks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HlsHookData {
    pub action: String,
    pub ip: String,
    pub vhost: String,
    pub app: String,
    pub param: String,
    pub duration: f32,
    pub file: String,
    pub url: String,
    pub m3u8: String,
    pub m3u8_url: String,
    pub seq_no: u64,
}

/// Dispatches hook events through a shared HTTP client.
pub struct HookDispatcher {
    tx: mpsc::Sender<HookEvent>,
}

impl HookDispatcher {
    /// Builds the dispatcher and spawns its workers; they exit when
    /// `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .tcp_keepalive(Duration::from_secs(3))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_millis(1000))
            .build()
            .expect("hook http client");

        let (tx, rx) = mpsc::channel(HOOK_EVENT_QUEUE_LEN);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..HOOK_EVENT_WORKER_NUM {
            let rx = rx.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            ev = rx.recv() => ev,
                        }
                    };
                    let Some(event) = event else { return };
                    if let Err(e) = handle_hook(&client, &event).await {
                        tracing::error!(url = %event.url, error = %e, "hook delivery failed");
                    }
                }
            });
        }

        Self { tx }
    }

    /// Non-blocking enqueue; silently drops when the queue is full.
    pub fn on_event(&self, event: HookEvent) {
        let _ = self.tx.try_send(event);
    }
}

async fn handle_hook(client: &reqwest::Client, event: &HookEvent) -> Result<(), reqwest::Error> {
    tracing::info!(url = %event.url, "delivering hook");
    let response = client.post(&event.url).json(&event.data).send().await?;
    response.error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_silently() {
        let cancel = CancellationToken::new();
        cancel.cancel(); // workers exit immediately, nothing drains
        let dispatcher = HookDispatcher::new(cancel);

        for i in 0..HOOK_EVENT_QUEUE_LEN + 100 {
            dispatcher.on_event(HookEvent {
                url: format!("http://127.0.0.1:1/{i}"),
                data: serde_json::json!({ "seq": i }),
            });
        }
        // reaching here without blocking is the property under test
    }
}
