//! Server-push event subscription.
//!
//! A [Subscription] describes one logical stream: which device (or fleet)
//! and which event name it is scoped to. It is immutable, so the continuity
//! controller can replay it verbatim after a reconnect. An open
//! [EventStream] decodes the server-sent-event framing incrementally and
//! yields [CloudEvent]s; stream errors and end-of-stream both mean the
//! subscription is lost and are handled identically upstream.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_lite::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::Credential;
use crate::util::http::{Auth, Client, ClientError, InvalidUriError, Method, StatusCode, Uri};

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The cloud refused the subscription (unknown device or product, or
    /// the credential was not accepted).
    #[error("subscription rejected: {0}")]
    Rejected(StatusCode),

    /// The stream endpoint could not be reached.
    #[error("failed to reach the event stream: {0}")]
    Transport(#[from] ClientError),

    /// The device, product or event filter does not form a valid endpoint.
    #[error("invalid subscription filter: {0}")]
    Filter(#[from] InvalidUriError),
}

/// Failure of an open stream. Recovery is the caller's job.
#[derive(Debug, Error)]
#[error("event stream interrupted: {0}")]
pub struct StreamError(#[from] ClientError);

/// Parameters describing one logical event subscription.
///
/// `device` empty or unset falls back to the caller's own devices, or to the
/// whole fleet when `product` is set.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Device ID or name. Empty means "any of mine" (user scope) or "any in
    /// the fleet" (product scope).
    pub device: Option<String>,

    /// Event name prefix filter. Empty matches every event.
    pub event: Option<String>,

    /// Product ID or slug the subscription is scoped to.
    pub product: Option<String>,
}

impl Subscription {
    /// Device segment of the stream endpoint, with the sentinel fallbacks
    /// applied.
    fn target_device(&self) -> Option<&str> {
        match self.device.as_deref() {
            None | Some("") => {
                if self.product.is_some() {
                    None
                } else {
                    Some("mine")
                }
            }
            Some(device) => Some(device),
        }
    }

    /// Path of the stream endpoint this subscription maps to.
    fn events_path(&self) -> String {
        let mut path = match &self.product {
            Some(product) => format!("/v1/products/{product}"),
            None => "/v1".to_string(),
        };

        match self.target_device() {
            Some("mine") => path.push_str("/devices/events"),
            Some(device) => {
                path.push_str("/devices/");
                path.push_str(device);
                path.push_str("/events");
            }
            None => path.push_str("/events"),
        }

        if let Some(event) = self.event.as_deref().filter(|e| !e.is_empty()) {
            path.push('/');
            path.push_str(event);
        }

        path
    }
}

/// Event delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    pub name: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
    pub device_id: String,
}

/// Wire envelope carried in the `data:` field of a stream frame.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: String,
    published_at: DateTime<Utc>,
    coreid: String,
}

/// One live server-push subscription.
///
/// Dropping the handle aborts the underlying connection.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>,
    decoder: FrameDecoder,
}

impl EventStream {
    /// Request a push stream scoped to `subscription`, authenticated with
    /// `credential`.
    pub async fn open(
        client: &Client,
        base: &Uri,
        subscription: &Subscription,
        credential: &Credential,
    ) -> Result<Self, SubscribeError> {
        let uri = Uri::from_parts(base.clone(), &subscription.events_path(), None)?;
        let auth = Auth::Bearer {
            token: credential.token().to_string(),
        };

        let response = client
            .request(Method::GET, &uri, Some(&auth), |req| {
                Ok(req.header("Accept", "text/event-stream"))
            })
            .await
            .map_err(SubscribeError::Transport)?;

        match response.status() {
            status if status.is_success() => {
                info!(%uri, "event stream open");
                Ok(Self {
                    inner: Box::pin(response.stream()),
                    decoder: FrameDecoder::default(),
                })
            }
            status => Err(SubscribeError::Rejected(status)),
        }
    }

    /// Next decoded event.
    ///
    /// `None` means the server closed the stream; `Err` means the transport
    /// failed. Either way the subscription is gone and the handle should be
    /// dropped.
    pub async fn next_event(&mut self) -> Option<Result<CloudEvent, StreamError>> {
        loop {
            if let Some(event) = self.decoder.next_ready() {
                return Some(Ok(event));
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.decoder.feed(&chunk),
                Some(Err(e)) => return Some(Err(StreamError(e))),
                None => return None,
            }
        }
    }
}

/// Incremental decoder for the `text/event-stream` framing.
///
/// Frames are `field: value` lines terminated by a blank line; `:` lines
/// are keepalive comments. Only the `event` and `data` fields are used by
/// the cloud.
#[derive(Default)]
struct FrameDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data: Vec<String>,
    ready: VecDeque<CloudEvent>,
}

impl FrameDecoder {
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.push_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    fn push_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }

        if line.starts_with(':') {
            // keepalive
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            other => debug!("ignoring stream field {other:?}"),
        }
    }

    fn dispatch(&mut self) {
        let name = self.event_name.take();
        let data = std::mem::take(&mut self.data);

        if data.is_empty() {
            return;
        }
        let Some(name) = name else {
            return;
        };

        match serde_json::from_str::<Envelope>(&data.join("\n")) {
            Ok(envelope) => self.ready.push_back(CloudEvent {
                name,
                payload: envelope.data,
                published_at: envelope.published_at,
                device_id: envelope.coreid,
            }),
            Err(e) => warn!("discarding malformed event frame: {e}"),
        }
    }

    fn next_ready(&mut self) -> Option<CloudEvent> {
        self.ready.pop_front()
    }
}
