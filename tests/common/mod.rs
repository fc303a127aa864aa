#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use stampede::{
    Connector, Request, RequestClient, Response, Scenario, TransportError, UserProfile,
    client::TransportErrorKind,
};

/// Scripted transport: fixed status and latency, records every request, tracks how many
/// clients are alive. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    status: u16,
    latency: Duration,
    refuse: bool,
    requests: Arc<Mutex<Vec<Request>>>,
    live: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every `connect` fails, as if the target were unreachable.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::ok()
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn live_clients(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn RequestClient>, TransportError> {
        if self.refuse {
            return Err(TransportError::new(
                TransportErrorKind::Connect,
                "connection refused",
            ));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockClient(self.clone())))
    }
}

struct MockClient(MockConnector);

#[async_trait]
impl RequestClient for MockClient {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        self.0.requests.lock().push(request);
        if !self.0.latency.is_zero() {
            tokio::time::sleep(self.0.latency).await;
        }
        Ok(Response {
            status: self.0.status,
            body: br#"{"ok":true}"#.to_vec(),
            elapsed: self.0.latency,
        })
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn scenario(connector: &MockConnector, profiles: Vec<UserProfile>) -> Scenario {
    Scenario::builder()
        .name("test scenario")
        .host("http://target.test")
        .profiles(profiles)
        .connector(Arc::new(connector.clone()))
        .build()
}
