//! Message brokers for the remote-queue transport.
//!
//! A broker carries two streams of opaque text messages: evaluation requests
//! from the mapper to the workers and replies from the workers back. Messages
//! may be delivered out of order or more than once; the mapper copes with
//! both.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::error::{FitError, Result};

/// Two-way message queue between a [`super::QueueMapper`] and its workers.
pub trait QueueBroker: Send + Sync {
    fn publish_request(&self, body: String) -> Result<()>;

    /// Wait up to `timeout` for the next request; `None` when none arrived.
    fn next_request(&self, timeout: Duration) -> Result<Option<String>>;

    fn publish_reply(&self, body: String) -> Result<()>;

    /// Wait up to `timeout` for the next reply; `None` when none arrived.
    fn next_reply(&self, timeout: Duration) -> Result<Option<String>>;
}

/// In-memory broker for workers running in the same process.
#[derive(Debug, Clone)]
pub struct ChannelBroker {
    requests: (Sender<String>, Receiver<String>),
    replies: (Sender<String>, Receiver<String>),
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self {
            requests: unbounded(),
            replies: unbounded(),
        }
    }

    /// Requests waiting for a worker
    pub fn pending_requests(&self) -> usize {
        self.requests.1.len()
    }
}

fn receive(rx: &Receiver<String>, timeout: Duration) -> Result<Option<String>> {
    match rx.recv_timeout(timeout) {
        Ok(body) => Ok(Some(body)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => {
            Err(FitError::Transport("broker channel closed".to_string()))
        }
    }
}

impl QueueBroker for ChannelBroker {
    fn publish_request(&self, body: String) -> Result<()> {
        self.requests
            .0
            .send(body)
            .map_err(|e| FitError::Transport(e.to_string()))
    }

    fn next_request(&self, timeout: Duration) -> Result<Option<String>> {
        receive(&self.requests.1, timeout)
    }

    fn publish_reply(&self, body: String) -> Result<()> {
        self.replies
            .0
            .send(body)
            .map_err(|e| FitError::Transport(e.to_string()))
    }

    fn next_reply(&self, timeout: Duration) -> Result<Option<String>> {
        receive(&self.replies.1, timeout)
    }
}

/// Broker reached over HTTP.
///
/// Messages are posted to `{base}/{queue}/requests` and
/// `{base}/{queue}/replies`; `GET .../next?timeout_ms=N` long-polls for the
/// next message and answers `204 No Content` when the queue stayed empty.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::blocking::Client,
    base_url: String,
    queue: String,
}

impl HttpBroker {
    pub fn new(base_url: impl Into<String>, queue: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            queue: queue.into(),
        })
    }

    fn url(&self, stream: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.queue, stream)
    }

    fn post(&self, stream: &str, body: String) -> Result<()> {
        let response = self
            .client
            .post(self.url(stream))
            .header("content-type", "application/json")
            .body(body)
            .send()?;
        if !response.status().is_success() {
            return Err(FitError::Transport(format!(
                "broker refused message on {}: {}",
                stream,
                response.status()
            )));
        }
        Ok(())
    }

    fn next(&self, stream: &str, timeout: Duration) -> Result<Option<String>> {
        let url = format!("{}/next", self.url(stream));
        let response = self
            .client
            .get(url)
            .query(&[("timeout_ms", timeout.as_millis().to_string())])
            .send()?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let body = response.text()?;
                debug!("received {} bytes on {}", body.len(), stream);
                Ok(Some(body))
            }
            status => Err(FitError::Transport(format!(
                "broker poll on {} failed: {}",
                stream, status
            ))),
        }
    }
}

impl QueueBroker for HttpBroker {
    fn publish_request(&self, body: String) -> Result<()> {
        self.post("requests", body)
    }

    fn next_request(&self, timeout: Duration) -> Result<Option<String>> {
        self.next("requests", timeout)
    }

    fn publish_reply(&self, body: String) -> Result<()> {
        self.post("replies", body)
    }

    fn next_reply(&self, timeout: Duration) -> Result<Option<String>> {
        self.next("replies", timeout)
    }
}
