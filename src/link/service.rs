use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{info, instrument, warn};

use crate::api::DeviceApi;
use crate::config::Config;
use crate::events::{CloudEvent, EventStream, StreamError, SubscribeError, Subscription};
use crate::session::{AuthClient, AuthError, Credential};
use crate::util::http::{Client, Uri};

use super::status::{LinkState, LinkStatus};

/// Initial setup failure. Terminal: the link does not retry these, since
/// they usually mean bad configuration rather than a transient outage.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("subscribe failed: {0}")]
    Subscribe(#[from] SubscribeError),
}

/// Channels handed to the supervisor task when the link connects.
struct Handles {
    status_tx: watch::Sender<LinkStatus>,
    credential_tx: watch::Sender<Option<Credential>>,
}

/// Service maintaining one authenticated session and, optionally, one event
/// subscription against the device cloud.
///
/// The service logs in on [connect](CloudLink::connect), renews the access
/// token before the server-side expiry, and rebuilds the credential and the
/// stream whenever either is lost. Consumers observe progress on the
/// [status](CloudLink::status) channel and make one-shot calls through
/// [api](CloudLink::api).
///
/// # Example
/// ```rust,ignore
/// use tokio::sync::mpsc;
///
/// let mut link = CloudLink::new(Config::from_env()?);
/// let (tx, mut rx) = mpsc::unbounded_channel();
///
/// let subscription = Subscription {
///     event: Some("temperature".to_string()),
///     ..Default::default()
/// };
/// link.connect(Some(subscription), tx).await?;
///
/// while let Some(event) = rx.recv().await {
///     println!("{}: {}", event.name, event.payload);
/// }
/// ```
pub struct CloudLink {
    config: Config,
    auth: AuthClient,
    handles: Option<Handles>,
    status_rx: watch::Receiver<LinkStatus>,
    credential_rx: watch::Receiver<Option<Credential>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl CloudLink {
    pub fn new(config: Config) -> Self {
        let (status_tx, status_rx) =
            watch::channel(LinkStatus::new(LinkState::SettingUp, "not started"));
        let (credential_tx, credential_rx) = watch::channel(None);
        let (shutdown_tx, _) = broadcast::channel(1);
        let auth = AuthClient::new(&config);

        Self {
            config,
            auth,
            handles: Some(Handles {
                status_tx,
                credential_tx,
            }),
            status_rx,
            credential_rx,
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Watch the link status. Late subscribers see the current state.
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Facade for one-shot calls. Each call picks up whatever credential is
    /// current when it goes out, so the facade stays valid across renewals.
    pub fn api(&self) -> DeviceApi {
        DeviceApi::new(
            Client::new(Some(self.config.request_timeout)),
            self.config.api_endpoint.clone(),
            self.credential_rx.clone(),
        )
    }

    /// Log in and, if a subscription is given, open its event stream, then
    /// hand both to the background supervisor.
    ///
    /// Setup failures are terminal: the error is returned, the status
    /// channel reports `failed`, and nothing is retried. Once this returns
    /// `Ok` the link recovers on its own from token expiry and stream loss
    /// until [stop](CloudLink::stop) is called.
    ///
    /// Events decoded from the stream are delivered to `events` in arrival
    /// order. Without a subscription the channel is unused.
    pub async fn connect(
        &mut self,
        subscription: Option<Subscription>,
        events: mpsc::UnboundedSender<CloudEvent>,
    ) -> Result<(), SetupError> {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("link already stopped, not connecting");
            return Ok(());
        }
        let Some(handles) = self.handles.take() else {
            warn!("link already connected");
            return Ok(());
        };
        let Handles {
            status_tx,
            credential_tx,
        } = handles;

        // Subscribe before the first await so a stop() racing with setup is
        // not lost
        let shutdown_rx = self.shutdown_tx.subscribe();

        status_tx.send_replace(LinkStatus::new(LinkState::SettingUp, "authenticating"));
        let credential = match self.auth.login().await {
            Ok(credential) => credential,
            Err(e) => {
                status_tx.send_replace(LinkStatus::new(LinkState::Failed, "setup failed"));
                return Err(e.into());
            }
        };

        // Streaming requests are exempt from the one-shot request timeout
        let stream_client = Client::new(None);
        let stream = match &subscription {
            Some(subscription) => {
                status_tx.send_replace(LinkStatus::new(LinkState::SettingUp, "subscribing"));
                match EventStream::open(
                    &stream_client,
                    &self.config.api_endpoint,
                    subscription,
                    &credential,
                )
                .await
                {
                    Ok(stream) => Some(stream),
                    Err(e) => {
                        status_tx
                            .send_replace(LinkStatus::new(LinkState::Failed, "subscribe failed"));
                        // Don't leave an unused token behind
                        self.auth.revoke(Some(&credential)).await;
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        credential_tx.send_replace(Some(credential.clone()));
        status_tx.send_replace(LinkStatus::new(LinkState::Active, "connected"));
        info!("link established");

        let supervisor = Supervisor {
            auth: self.auth.clone(),
            stream_client,
            endpoint: self.config.api_endpoint.clone(),
            retry_interval: self.config.retry_interval,
            subscription,
            events,
            credential_tx,
            status_tx,
        };
        tokio::spawn(supervisor.run(credential, stream, shutdown_rx));

        Ok(())
    }

    /// Stop the link: close the stream, revoke the credential, cancel any
    /// pending renewal or retry.
    ///
    /// Idempotent. Safe to call repeatedly, before [connect](CloudLink::connect),
    /// or while a recovery is waiting out its retry interval.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for CloudLink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background task owning the credential, the stream handle and the single
/// pending timer (renewal deadline or retry backoff, never both).
struct Supervisor {
    auth: AuthClient,
    stream_client: Client,
    endpoint: Uri,
    retry_interval: Duration,
    subscription: Option<Subscription>,
    events: mpsc::UnboundedSender<CloudEvent>,
    credential_tx: watch::Sender<Option<Credential>>,
    status_tx: watch::Sender<LinkStatus>,
}

impl Supervisor {
    #[instrument(name = "link", skip_all)]
    async fn run(
        mut self,
        mut credential: Credential,
        mut stream: Option<EventStream>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let renew_at = credential.renew_deadline();

            tokio::select! {
                _ = shutdown_rx.recv() => break,

                _ = time::sleep_until(renew_at) => {
                    info!("access token expiring, rotating the session");
                    if !self
                        .recover(&mut shutdown_rx, &mut credential, &mut stream, "access token expiring")
                        .await
                    {
                        break;
                    }
                }

                item = next_stream_item(&mut stream), if stream.is_some() => {
                    match item {
                        Some(Ok(event)) => {
                            // The receiver going away is not our problem
                            let _ = self.events.send(event);
                        }
                        Some(Err(e)) => {
                            warn!("subscription lost: {e}");
                            if !self
                                .recover(&mut shutdown_rx, &mut credential, &mut stream, "event stream lost")
                                .await
                            {
                                break;
                            }
                        }
                        None => {
                            warn!("subscription lost: stream closed by the server");
                            if !self
                                .recover(&mut shutdown_rx, &mut credential, &mut stream, "event stream closed")
                                .await
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Close the stream before revoking the credential that opened it
        drop(stream);
        self.credential_tx.send_replace(None);
        self.auth.revoke(Some(&credential)).await;
        self.status_tx
            .send_replace(LinkStatus::new(LinkState::Stopped, "stopped"));
        info!("link stopped");
    }

    /// Tear down the credential and stream pair and rebuild both, retrying
    /// the login on a fixed interval until it succeeds or a shutdown
    /// arrives.
    ///
    /// Returns false when interrupted by shutdown.
    async fn recover(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        credential: &mut Credential,
        stream: &mut Option<EventStream>,
        reason: &str,
    ) -> bool {
        self.status_tx
            .send_replace(LinkStatus::new(LinkState::Reauthenticating, reason));

        // Stream first, so no authenticated stream outlives its token
        stream.take();
        self.credential_tx.send_replace(None);
        self.auth.revoke(Some(credential)).await;

        *credential = loop {
            match self.auth.login().await {
                Ok(fresh) => break fresh,
                Err(e) => {
                    warn!(
                        "failed to reauthenticate, retrying in {:?}: {e}",
                        self.retry_interval
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => return false,
                        _ = time::sleep(self.retry_interval) => {}
                    }
                }
            }
        };
        self.credential_tx.send_replace(Some(credential.clone()));

        let mut reason = "connected";
        if let Some(subscription) = &self.subscription {
            info!("reconnecting to the event stream");
            match EventStream::open(&self.stream_client, &self.endpoint, subscription, credential)
                .await
            {
                Ok(fresh) => *stream = Some(fresh),
                Err(e) => {
                    // Not retried on its own: the fresh credential's renewal
                    // deadline runs the full recovery again
                    warn!("failed to reconnect to the event stream: {e}");
                    reason = "event stream unavailable";
                }
            }
        }

        self.status_tx
            .send_replace(LinkStatus::new(LinkState::Active, reason));
        true
    }
}

async fn next_stream_item(
    stream: &mut Option<EventStream>,
) -> Option<Result<CloudEvent, StreamError>> {
    match stream {
        Some(stream) => stream.next_event().await,
        // Disabled by the select guard; never polled to completion
        None => std::future::pending().await,
    }
}
