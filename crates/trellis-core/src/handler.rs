//! Request handlers.
//!
//! Requests carry a numeric type tag. The service routes each one to the
//! [`Handler`] registered for that tag in its dispatch table, which is built once
//! at construction and never modified afterwards.

use crate::service::{Service, ServiceError};
use crate::subscriber::SharedSubscriber;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Request type of the built-in presence handler.
pub const REQUEST_PRESENCE: u32 = 0x01;

/// A request routed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request ID, echoed in the response.
    pub id: u16,
    /// Connection that sent the request.
    pub subscriber: SharedSubscriber,
    /// Raw request body.
    pub payload: Bytes,
}

/// Handles one request type.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The request type tag this handler serves.
    fn kind(&self) -> u32;

    /// Handle a request and return the encoded response.
    async fn handle(&self, service: &Service, request: Request) -> Result<Bytes, ServiceError>;
}

/// Body of a presence request.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceRequest {
    /// Key authorizing the request.
    pub key: String,
    /// Channel whose presence is requested.
    pub channel: String,
    /// Return the current roster.
    #[serde(default)]
    pub status: bool,
    /// Start (`true`) or stop (`false`) following presence changes.
    #[serde(default)]
    pub changes: Option<bool>,
}

/// Serves presence status queries and change subscriptions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PresenceHandler;

#[async_trait]
impl Handler for PresenceHandler {
    fn kind(&self) -> u32 {
        REQUEST_PRESENCE
    }

    async fn handle(&self, service: &Service, request: Request) -> Result<Bytes, ServiceError> {
        let body: PresenceRequest = serde_json::from_slice(&request.payload)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))?;
        debug!(connection = %request.subscriber.id(), channel = %body.channel, "Presence request");

        if let Some(follow) = body.changes {
            service.watch_presence(&request.subscriber, &body.key, &body.channel, follow)?;
        }

        if body.status {
            let status = service.presence_status(&body.key, &body.channel, request.id)?;
            return Ok(Bytes::from(serde_json::to_vec(&status)?));
        }

        Ok(Bytes::from(serde_json::to_vec(
            &json!({ "req": request.id, "status": 200 }),
        )?))
    }
}
