//! Abstraction over an authenticated link to an agent service.
//!
//! The pool is generic over this trait so its concurrency behavior can
//! be tested without sockets.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use roomcast_client::{ClientError, Endpoint};
use roomcast_identity::DeviceIdentity;
use roomcast_protocol::envelope::Event;
use roomcast_protocol::handshake::ClientInfo;

use crate::dispatch::AgentTarget;

/// One outbound link to an agent service.
pub trait Link: Send + Sync + 'static {
    /// Returns `true` while the link is connected and authenticated.
    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    /// Calls a method on the service, returning the raw payload.
    fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send;

    /// Registers a handler for a named push event.
    fn on_event(
        &self,
        event: &str,
        handler: Box<dyn Fn(Event) + Send + Sync>,
    ) -> impl Future<Output = ()> + Send;

    /// Tears the link down.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl Link for Endpoint {
    async fn is_connected(&self) -> bool {
        Endpoint::is_connected(self).await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let resp = Endpoint::call_with_timeout(self, method, Some(&params), timeout).await?;
        Ok(resp.payload.unwrap_or(Value::Null))
    }

    async fn on_event(&self, event: &str, handler: Box<dyn Fn(Event) + Send + Sync>) {
        Endpoint::on(self, event, move |ev| handler(ev)).await;
    }

    async fn close(&self) {
        Endpoint::disconnect(self).await;
    }
}

/// Builds a connected [`Endpoint`] for an agent service target.
///
/// The hub presents its own device identity and the per-agent
/// credential configured by the room member who added the agent.
pub async fn connect_endpoint(
    target: &AgentTarget,
    identity: Arc<DeviceIdentity>,
) -> Result<Arc<Endpoint>, ClientError> {
    let config = roomcast_client::EndpointConfig {
        url: target.address.clone(),
        client: ClientInfo {
            id: format!("hub-{}", &identity.id()[..12]),
            display_name: "Roomcast Hub".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: "service".into(),
        },
        role: "hub".into(),
        scopes: vec!["chat".into()],
        caps: vec![],
        token: target.credential.clone(),
    };
    let endpoint = Arc::new(Endpoint::new(config, identity, None));
    endpoint.connect().await?;
    Ok(endpoint)
}

/// Serializes parameters for a [`Link::call_with_timeout`] call.
pub fn to_params<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}
