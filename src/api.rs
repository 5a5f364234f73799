//! One-shot calls against the device cloud, with the current credential
//! injected at the instant of use.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::session::Credential;
use crate::util::http::{Auth, Client, ClientError, InvalidUriError, StatusCode, Uri};

#[derive(Debug, Error)]
pub enum RequestError {
    /// No credential is currently held (not connected, or mid-recovery).
    #[error("no active session")]
    NoSession,

    /// The cloud refused the request.
    #[error("request rejected: {0}")]
    Rejected(StatusCode),

    /// The cloud could not be reached.
    #[error("request failed: {0}")]
    Transport(ClientError),

    /// The reply did not have the expected shape.
    #[error("unexpected response: {0}")]
    Response(String),

    /// The device, product or name does not form a valid endpoint.
    #[error("invalid request path: {0}")]
    Path(#[from] InvalidUriError),
}

impl From<ClientError> for RequestError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Response(status) => RequestError::Rejected(status),
            ClientError::Decode(e) => RequestError::Response(e.to_string()),
            other => RequestError::Transport(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VariableReply {
    result: Value,
}

#[derive(Debug, Deserialize)]
struct FunctionReply {
    return_value: i64,
}

#[derive(Debug, Deserialize)]
struct PublishReply {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct FunctionCall<'a> {
    arg: &'a str,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    name: &'a str,
    data: &'a str,
    private: bool,
}

/// Facade for reading variables, calling functions and publishing events.
///
/// The credential is read from the controller's watch channel on every call,
/// never cached: recovery can replace it at any time.
#[derive(Debug, Clone)]
pub struct DeviceApi {
    client: Client,
    base: Uri,
    credential: watch::Receiver<Option<Credential>>,
}

impl DeviceApi {
    pub(crate) fn new(
        client: Client,
        base: Uri,
        credential: watch::Receiver<Option<Credential>>,
    ) -> Self {
        Self {
            client,
            base,
            credential,
        }
    }

    fn auth(&self) -> Result<Auth, RequestError> {
        self.credential
            .borrow()
            .as_ref()
            .map(|credential| Auth::Bearer {
                token: credential.token().to_string(),
            })
            .ok_or(RequestError::NoSession)
    }

    fn endpoint(&self, product: Option<&str>, tail: &str) -> Result<Uri, RequestError> {
        let path = match product {
            Some(product) => format!("/v1/products/{product}{tail}"),
            None => format!("/v1{tail}"),
        };
        Ok(Uri::from_parts(self.base.clone(), &path, None)?)
    }

    /// Current value of a device variable.
    pub async fn variable(&self, device: &str, name: &str) -> Result<Value, RequestError> {
        self.variable_scoped(None, device, name).await
    }

    /// Current value of a device variable, for a device in a product fleet.
    pub async fn variable_in_product(
        &self,
        product: &str,
        device: &str,
        name: &str,
    ) -> Result<Value, RequestError> {
        self.variable_scoped(Some(product), device, name).await
    }

    async fn variable_scoped(
        &self,
        product: Option<&str>,
        device: &str,
        name: &str,
    ) -> Result<Value, RequestError> {
        let auth = self.auth()?;
        let uri = self.endpoint(product, &format!("/devices/{device}/{name}"))?;

        debug!(%uri, "reading variable");
        let reply: VariableReply = self.client.get(&uri, Some(&auth)).await?;
        Ok(reply.result)
    }

    /// Call a function exposed by the device firmware.
    pub async fn call_function(
        &self,
        device: &str,
        name: &str,
        arg: &str,
    ) -> Result<i64, RequestError> {
        self.call_function_scoped(None, device, name, arg).await
    }

    /// Call a device function, for a device in a product fleet.
    pub async fn call_function_in_product(
        &self,
        product: &str,
        device: &str,
        name: &str,
        arg: &str,
    ) -> Result<i64, RequestError> {
        self.call_function_scoped(Some(product), device, name, arg)
            .await
    }

    async fn call_function_scoped(
        &self,
        product: Option<&str>,
        device: &str,
        name: &str,
        arg: &str,
    ) -> Result<i64, RequestError> {
        let auth = self.auth()?;
        let uri = self.endpoint(product, &format!("/devices/{device}/{name}"))?;

        debug!(%uri, "calling function");
        let reply: FunctionReply = self
            .client
            .post(&uri, Some(&auth), &FunctionCall { arg })
            .await?;
        Ok(reply.return_value)
    }

    /// Publish an event into the cloud's stream.
    pub async fn publish(&self, name: &str, data: &str, private: bool) -> Result<(), RequestError> {
        self.publish_scoped(None, name, data, private).await
    }

    /// Publish an event into a product's stream.
    pub async fn publish_in_product(
        &self,
        product: &str,
        name: &str,
        data: &str,
        private: bool,
    ) -> Result<(), RequestError> {
        self.publish_scoped(Some(product), name, data, private)
            .await
    }

    async fn publish_scoped(
        &self,
        product: Option<&str>,
        name: &str,
        data: &str,
        private: bool,
    ) -> Result<(), RequestError> {
        let auth = self.auth()?;
        let uri = self.endpoint(product, "/devices/events")?;

        debug!(%uri, name, "publishing event");
        let reply: PublishReply = self
            .client
            .post(&uri, Some(&auth), &PublishRequest { name, data, private })
            .await?;

        if !reply.ok {
            return Err(RequestError::Response(
                "publish not acknowledged".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::time::Duration;

    fn api_with_token(url: String, token: Option<&str>) -> DeviceApi {
        let credential =
            token.map(|t| Credential::new(t.to_string(), Duration::from_secs(3600)));
        // The last value in a watch channel stays readable after the
        // sender is dropped
        let (_tx, rx) = watch::channel(credential);
        DeviceApi::new(Client::new(None), url.parse().unwrap(), rx)
    }

    #[tokio::test]
    async fn test_variable_returns_result_field() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("GET", "/v1/devices/d0/temperature")
            .match_header("authorization", "Bearer t-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"temperature","result":21.5,"coreInfo":{}}"#)
            .create_async()
            .await;

        let api = api_with_token(server.url(), Some("t-123"));
        let value = api.variable("d0", "temperature").await.unwrap();
        assert_eq!(value, json!(21.5));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_variable_in_product_routes_through_product() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("GET", "/v1/products/tracker/devices/d0/temperature")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":"ok"}"#)
            .create_async()
            .await;

        let api = api_with_token(server.url(), Some("t-123"));
        let value = api
            .variable_in_product("tracker", "d0", "temperature")
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_call_function_returns_return_value() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("POST", "/v1/devices/d0/reboot")
            .match_header("authorization", "Bearer t-123")
            .match_body(Matcher::Json(json!({"arg": "now"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"return_value":1,"connected":true}"#)
            .create_async()
            .await;

        let api = api_with_token(server.url(), Some("t-123"));
        let value = api.call_function("d0", "reboot", "now").await.unwrap();
        assert_eq!(value, 1);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_sends_event() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("POST", "/v1/devices/events")
            .match_body(Matcher::Json(json!({
                "name": "door",
                "data": "open",
                "private": true,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let api = api_with_token(server.url(), Some("t-123"));
        api.publish("door", "open", true).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_request() {
        let mut server = Server::new_async().await;

        let mock = server
            .mock("GET", "/v1/devices/d0/temperature")
            .with_status(403)
            .create_async()
            .await;

        let api = api_with_token(server.url(), Some("t-123"));
        let result = api.variable("d0", "temperature").await;
        assert!(matches!(
            result,
            Err(RequestError::Rejected(StatusCode::FORBIDDEN))
        ));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_session_without_credential() {
        let server = Server::new_async().await;

        let api = api_with_token(server.url(), None);
        let result = api.variable("d0", "temperature").await;
        assert!(matches!(result, Err(RequestError::NoSession)));
    }
}
