/*
This crate keeps a device-cloud session alive so its users don't have to.

It logs in with OAuth2 client credentials, renews the access token before
the server-side expiry, holds one server-push event subscription open, and
when the token rotates or the stream drops it tears both down and rebuilds
them with the same parameters, retrying through outages.

The entry point is [CloudLink]: connect it with an optional [Subscription],
receive decoded [CloudEvent]s on a channel, watch progress on its status
channel, and make one-shot device calls through [DeviceApi] with the
current credential injected automatically.
*/

pub mod api;
pub mod config;
pub mod events;
pub mod link;
pub mod session;
pub mod util;

pub use api::{DeviceApi, RequestError};
pub use config::{Config, ConfigError};
pub use events::{CloudEvent, EventStream, StreamError, SubscribeError, Subscription};
pub use link::{CloudLink, LinkState, LinkStatus, SetupError};
pub use session::{AuthClient, AuthError, Credential, MAX_RENEW_DELAY};
