//! In-memory transport for unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{Connector, Request, RequestClient, Response, TransportError};

/// Answers every request with a fixed status after a fixed latency and logs what it
/// was sent. Clones share the log and the client counters.
#[derive(Clone)]
pub(crate) struct MockConnector {
    status: u16,
    latency: Duration,
    log: Arc<Mutex<Vec<Request>>>,
    live: Arc<AtomicUsize>,
}

impl MockConnector {
    pub(crate) fn ok() -> Self {
        Self::with_status(200)
    }

    pub(crate) fn with_status(status: u16) -> Self {
        Self {
            status,
            latency: Duration::ZERO,
            log: Arc::default(),
            live: Arc::default(),
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.log.lock().clone()
    }

    /// Clients handed out and not yet dropped.
    pub(crate) fn live_clients(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn RequestClient>, TransportError> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockClient {
            connector: self.clone(),
        }))
    }
}

struct MockClient {
    connector: MockConnector,
}

#[async_trait]
impl RequestClient for MockClient {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.connector.log.lock().push(request);
        if !self.connector.latency.is_zero() {
            tokio::time::sleep(self.connector.latency).await;
        }
        Ok(Response {
            status: self.connector.status,
            body: b"{}".to_vec(),
            elapsed: self.connector.latency,
        })
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.connector.live.fetch_sub(1, Ordering::SeqCst);
    }
}
