use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::time::Instant;

use crate::transport::{Transport, TransportError};
use crate::{RawResponse, RequestDescriptor, ServerKey};

type Script = dyn Fn(&RequestDescriptor, usize) -> Result<RawResponse, TransportError> + Send + Sync;

/// A request seen by a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) route: String,
    pub(crate) at: Instant,
}

/// In-memory [`Transport`] answering from a script.
///
/// The script gets the request and the number of earlier calls with the
/// same route.
pub(crate) struct ScriptedTransport {
    script: Box<Script>,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        script: impl Fn(&RequestDescriptor, usize) -> Result<RawResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Self::with_latency(Duration::ZERO, script)
    }

    pub(crate) fn with_latency(
        latency: Duration,
        script: impl Fn(&RequestDescriptor, usize) -> Result<RawResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            latency,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Always answer 200 with the route as body
    pub(crate) fn ok() -> Arc<Self> {
        Self::new(|request, _| Ok(reply(200, &[], request.route())))
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn routes(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.route).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<RawResponse, TransportError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            let seen = calls
                .iter()
                .filter(|call| call.route == request.route())
                .count();
            calls.push(Call {
                route: request.route().to_string(),
                at: Instant::now(),
            });
            seen
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.script)(request, seen)
    }
}

/// Build a response with status, headers and body
pub(crate) fn reply(status: u16, headers: &[(&'static str, &str)], body: &str) -> RawResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    RawResponse::new(
        StatusCode::from_u16(status).unwrap(),
        map,
        body.as_bytes().to_vec(),
    )
}

/// A valid server key, distinct per `seed`
pub(crate) fn server_key(seed: char) -> ServerKey {
    format!("{}-{}", "a".repeat(10), seed.to_string().repeat(40))
        .parse()
        .unwrap()
}
