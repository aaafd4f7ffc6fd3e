//! Relay runners and their lifecycle manager.

pub mod pull;
pub mod push;

pub use pull::FlvPuller;
pub use push::RtmpPusher;

use crate::error::{Result, StreamerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A long-running relay task driven until its token is canceled.
#[async_trait]
pub trait Runner: Send {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()>;
}

/// Tracks named relay runs, enforcing name uniqueness and a per-run
/// duration budget.
#[derive(Default)]
pub struct Manager {
    streams: Mutex<HashMap<String, CancellationToken>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `runner` under `name` until it finishes or `duration`
    /// elapses. A second launch under a live name fails with the
    /// duplicate-stream code; hitting the duration budget is a clean
    /// exit.
    pub async fn launch(&self, name: &str, runner: &mut dyn Runner, duration: Duration) -> Result<()> {
        let token = {
            let mut streams = self.streams.lock().expect("manager lock");
            if streams.contains_key(name) {
                return Err(StreamerError::duplicate_stream(name));
            }
            let token = CancellationToken::new();
            streams.insert(name.to_string(), token.clone());
            token
        };

        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                token.cancel();
            })
        };

        let result = runner.run(token.clone()).await;
        timer.abort();
        self.streams.lock().expect("manager lock").remove(name);

        match result {
            Err(StreamerError::Canceled) if token.is_cancelled() => Ok(()),
            other => other,
        }
    }

    /// Cancels the named run.
    pub fn stop(&self, name: &str) -> Result<()> {
        let streams = self.streams.lock().expect("manager lock");
        match streams.get(name) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(StreamerError::stream_not_exist(name)),
        }
    }

    /// Cancels every tracked run.
    pub fn stop_all(&self) {
        let streams = self.streams.lock().expect("manager lock");
        for token in streams.values() {
            token.cancel();
        }
    }

    /// Names of the currently-tracked runs.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams
            .lock()
            .expect("manager lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_DUPLICATE_STREAM;
    use pretty_assertions::assert_eq;

    struct BlockUntilCanceled;

    #[async_trait]
    impl Runner for BlockUntilCanceled {
        async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Err(StreamerError::Canceled)
        }
    }

    #[tokio::test]
    async fn duration_elapse_is_clean_exit() {
        let mgr = Manager::new();
        let mut runner = BlockUntilCanceled;
        mgr.launch("s1", &mut runner, Duration::from_millis(20)).await.unwrap();
        assert!(mgr.stream_names().is_empty());
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let mgr = std::sync::Arc::new(Manager::new());

        let mgr2 = mgr.clone();
        let first = tokio::spawn(async move {
            let mut runner = BlockUntilCanceled;
            mgr2.launch("s1", &mut runner, Duration::from_secs(5)).await
        });

        // wait for the first launch to register
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut runner = BlockUntilCanceled;
        let err = mgr.launch("s1", &mut runner, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), CODE_DUPLICATE_STREAM);

        mgr.stop("s1").unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_unknown_stream() {
        let mgr = Manager::new();
        assert!(mgr.stop("nope").is_err());
    }
}
