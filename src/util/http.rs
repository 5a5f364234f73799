pub use client::{Auth, Client, ClientError, Method, Response, StatusCode};
pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("{0}")]
    pub struct InvalidUriError(String);

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    impl From<http::uri::InvalidUriParts> for InvalidUriError {
        fn from(value: http::uri::InvalidUriParts) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// Absolute URI for an API endpoint.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn from_static(src: &'static str) -> Self {
            Self(http::Uri::from_static(src))
        }

        /// Replace the path and query of `base_uri`, keeping scheme and
        /// authority.
        pub fn from_parts(
            base_uri: Uri,
            path: &str,
            query: Option<&str>,
        ) -> Result<Self, InvalidUriError> {
            let path_and_query = if let Some(qs) = query {
                http::uri::PathAndQuery::from_maybe_shared(format!("{path}?{qs}"))?
            } else {
                http::uri::PathAndQuery::from_str(path)?
            };
            let mut parts = base_uri.0.into_parts();
            parts.path_and_query = Some(path_and_query);

            Ok(Self(http::Uri::from_parts(parts)?))
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(http::Uri::from_str(s).map(Self)?)
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Ok(Self(http::Uri::from_maybe_shared(value)?))
        }
    }

    impl From<http::Uri> for Uri {
        fn from(value: http::Uri) -> Self {
            Self(value)
        }
    }

    impl From<Uri> for http::Uri {
        fn from(value: Uri) -> Self {
            value.0
        }
    }
}

mod client {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_lite::StreamExt;
    use reqwest::RequestBuilder;
    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use super::uri::Uri;

    pub type Method = reqwest::Method;
    pub type StatusCode = reqwest::StatusCode;

    /// Identification sent with every outbound request.
    const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

    #[derive(Debug, thiserror::Error)]
    pub enum ClientError {
        #[error("failed to build request: {0}")]
        Request(String),

        #[error("server replied with status: {0}")]
        Response(StatusCode),

        #[error("request failed: {0}")]
        Transport(reqwest::Error),

        #[error("failed to decode response: {0}")]
        Decode(reqwest::Error),
    }

    /// Credentials attached to a single request.
    #[derive(Debug, Clone)]
    pub enum Auth {
        Basic {
            username: String,
            password: Option<String>,
        },
        Bearer {
            token: String,
        },
    }

    #[derive(Debug)]
    pub struct Response(reqwest::Response);

    impl Response {
        pub fn status(&self) -> StatusCode {
            self.0.status()
        }

        /// Raw byte stream of the response body, for server-push endpoints
        /// where the body outlives the request.
        pub fn stream(self) -> impl futures_lite::Stream<Item = Result<Bytes, ClientError>> {
            self.0
                .bytes_stream()
                .map(|res| res.map_err(ClientError::Transport))
        }

        pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
            self.0.json().await.map_err(ClientError::Decode)
        }

        pub async fn text(self) -> Result<String, ClientError> {
            self.0.text().await.map_err(ClientError::Decode)
        }
    }

    /// Thin wrapper around [reqwest::Client].
    ///
    /// Credentials are passed per call rather than stored: the token a
    /// request goes out with can be replaced between calls, so callers must
    /// capture it at the instant of use.
    #[derive(Debug, Clone)]
    pub struct Client {
        client: reqwest::Client,
        timeout: Option<Duration>,
    }

    impl Client {
        /// A client with the given per-request timeout.
        ///
        /// Pass `None` for endpoints with long-lived streaming bodies, where
        /// a total request timeout would sever the stream mid-flight.
        pub fn new(timeout: Option<Duration>) -> Self {
            Self {
                client: reqwest::Client::new(),
                timeout,
            }
        }

        pub async fn get<R>(&self, uri: &Uri, auth: Option<&Auth>) -> Result<R, ClientError>
        where
            R: DeserializeOwned,
        {
            wrap_status_error(self.request(Method::GET, uri, auth, Ok).await?)?
                .json()
                .await
        }

        pub async fn post<P, R>(
            &self,
            uri: &Uri,
            auth: Option<&Auth>,
            payload: &P,
        ) -> Result<R, ClientError>
        where
            P: Serialize + ?Sized,
            R: DeserializeOwned,
        {
            wrap_status_error(
                self.request(Method::POST, uri, auth, |req| Ok(req.json(payload)))
                    .await?,
            )?
            .json()
            .await
        }

        /// POST with a form-encoded body, as token grant endpoints expect.
        pub async fn post_form<P, R>(
            &self,
            uri: &Uri,
            auth: Option<&Auth>,
            form: &P,
        ) -> Result<R, ClientError>
        where
            P: Serialize + ?Sized,
            R: DeserializeOwned,
        {
            wrap_status_error(
                self.request(Method::POST, uri, auth, |req| Ok(req.form(form)))
                    .await?,
            )?
            .json()
            .await
        }

        /// Thin wrapper around [reqwest::Request], this is your gateway to a
        /// fully customizable request if this type's methods won't do. No
        /// status check is applied to the response.
        pub async fn request<D>(
            &self,
            method: Method,
            uri: &Uri,
            auth: Option<&Auth>,
            decorator: D,
        ) -> Result<Response, ClientError>
        where
            D: FnOnce(RequestBuilder) -> Result<RequestBuilder, ClientError>,
        {
            let mut request = self
                .client
                .request(method, uri.to_string())
                .header(reqwest::header::USER_AGENT, USER_AGENT);

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            if let Some(auth) = auth {
                request = match auth {
                    Auth::Basic { username, password } => {
                        request.basic_auth(username, password.as_ref())
                    }
                    Auth::Bearer { token } => request.bearer_auth(token),
                };
            }

            request = decorator(request)?;

            Ok(Response(
                request.send().await.map_err(ClientError::Transport)?,
            ))
        }
    }

    fn wrap_status_error(res: Response) -> Result<Response, ClientError> {
        match res.status() {
            status if status.is_success() => Ok(res),
            status => Err(ClientError::Response(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::{json, Value};

    #[test]
    fn test_uri_from_parts_replaces_path() {
        let base: Uri = "https://api.example.com/old?x=1".parse().unwrap();
        let uri = Uri::from_parts(base, "/v1/devices/events", None).unwrap();
        assert_eq!(uri.to_string(), "https://api.example.com/v1/devices/events");
    }

    #[test]
    fn test_uri_from_parts_with_query() {
        let base: Uri = "https://api.example.com".parse().unwrap();
        let uri = Uri::from_parts(base, "/v1/events", Some("access_token=t")).unwrap();
        assert_eq!(
            uri.to_string(),
            "https://api.example.com/v1/events?access_token=t"
        );
    }

    #[tokio::test]
    async fn test_get_sends_user_agent_and_bearer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/thing")
            .match_header(
                "user-agent",
                concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
            )
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let base: Uri = server.url().parse().unwrap();
        let uri = Uri::from_parts(base, "/thing", None).unwrap();
        let client = Client::new(None);
        let auth = Auth::Bearer {
            token: "tok".to_string(),
        };

        let body: Value = client.get(&uri, Some(&auth)).await.unwrap();
        assert_eq!(body, json!({"ok": true}));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let base: Uri = server.url().parse().unwrap();
        let uri = Uri::from_parts(base, "/missing", None).unwrap();
        let client = Client::new(None);

        let res: Result<Value, ClientError> = client.get(&uri, None).await;
        assert!(matches!(
            res,
            Err(ClientError::Response(StatusCode::NOT_FOUND))
        ));

        mock.assert_async().await;
    }
}
