//! Client that manages connections over a single MQTT session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, DisconnectError};
use crate::interface::{Event, Incoming, MqttAck, MqttDisconnect, MqttEventLoop};
use crate::rumqttc_adapter as adapter;
use crate::session::ack_tracker::{AckTracker, RegisterError};
use crate::session::credential_refresh::CredentialRefreshProvider;
use crate::session::dispatcher::IncomingPublishDispatcher;
use crate::session::managed_client::SessionManagedClient;
use crate::session::outbound_queue::{self, OutboundQueue};
use crate::session::reconnect_policy::{ExponentialBackoffWithJitter, ReconnectPolicy};
use crate::session::state::SessionState;
use crate::session::{SessionError, SessionErrorKind};
use crate::MqttConnectionSettings;

/// Client managed by this crate's [`SessionManagedClient`] implementation.
pub type SessionPubSub = SessionManagedClient<OutboundQueue>;

/// Options for configuring a new [`Session`]
#[derive(Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct SessionOptions {
    /// MQTT Connection Settings for configuring the [`Session`]
    pub connection_settings: MqttConnectionSettings,
    /// Reconnect Policy to be used by the [`Session`]
    #[builder(default = "Box::new(ExponentialBackoffWithJitter::default())")]
    pub reconnect_policy: Box<dyn ReconnectPolicy>,
    /// Whether publishes dispatched to receivers created by this [`Session`] are acked
    /// automatically on receipt, rather than requiring a manual [`AckToken`](crate::interface::AckToken) ack.
    #[builder(default = "true")]
    pub auto_ack: bool,
    /// Provider used to renew enhanced authentication credentials while the [`Session`] runs.
    /// Required when `authentication_method`/`credential_file` are set on the connection settings.
    #[builder(default = "None")]
    pub credential_refresh_provider: Option<Box<dyn CredentialRefreshProvider>>,
}

/// Client that manages connections over a single MQTT session.
///
/// Use this centrally in an application to control the session and to create any necessary
/// [`SessionPubSub`], [`SessionManagedClient::PubReceiver`] and [`SessionExitHandle`].
pub struct Session {
    client: adapter::ClientAlias,
    event_loop: adapter::EventLoopAlias,
    client_id: String,
    authentication_method: Option<String>,
    credential_refresh_provider: Option<Box<dyn CredentialRefreshProvider>>,
    incoming_pub_dispatcher: Arc<Mutex<IncomingPublishDispatcher>>,
    ack_tracker: Arc<AckTracker>,
    managed_client: SessionPubSub,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    state: Arc<SessionState>,
    notify_force_exit: Arc<Notify>,
    previously_run: bool,
}

impl Session {
    /// Create a new [`Session`] with the provided options structure.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if there are errors using the session options.
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let client_id = options.connection_settings.client_id.clone();
        let authentication_method = options.connection_settings.authentication_method.clone();
        let (client, event_loop) = adapter::client(options.connection_settings, 100, true)
            .map_err(SessionErrorKind::from)?;

        let (dispatcher, unfiltered_rx) = IncomingPublishDispatcher::new(100);
        let incoming_pub_dispatcher = Arc::new(Mutex::new(dispatcher));
        let ack_tracker = Arc::new(AckTracker::default());
        let outbound_queue = OutboundQueue::new(client.clone(), outbound_queue::DEFAULT_CAPACITY);

        let managed_client = SessionManagedClient {
            client_id: client_id.clone(),
            pub_sub: outbound_queue,
            incoming_pub_dispatcher: Arc::clone(&incoming_pub_dispatcher),
            unfiltered_rx: Arc::new(Mutex::new(Some(unfiltered_rx))),
            ack_tracker: Arc::clone(&ack_tracker),
            auto_ack: options.auto_ack,
        };

        Ok(Self {
            client,
            event_loop,
            client_id,
            authentication_method,
            credential_refresh_provider: options.credential_refresh_provider,
            incoming_pub_dispatcher,
            ack_tracker,
            managed_client,
            reconnect_policy: options.reconnect_policy,
            state: Arc::new(SessionState::default()),
            notify_force_exit: Arc::new(Notify::new()),
            previously_run: false,
        })
    }

    /// Return the client ID of the MQTT client being used in this [`Session`]
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Return an instance of [`SessionPubSub`] that can be used to execute MQTT operations,
    /// create incoming publish receivers, and otherwise interact with the connection managed
    /// by this [`Session`].
    #[must_use]
    pub fn managed_client(&self) -> SessionPubSub {
        self.managed_client.clone()
    }

    /// Return an instance of [`SessionExitHandle`] that can be used to end this [`Session`]
    #[must_use]
    pub fn get_session_exit_handle(&self) -> SessionExitHandle {
        SessionExitHandle {
            disconnector: self.client.clone(),
            state: Arc::clone(&self.state),
            force_exit: Arc::clone(&self.notify_force_exit),
        }
    }

    /// Begin running the [`Session`].
    ///
    /// Blocks until either a session exit or a fatal connection error is encountered.
    ///
    /// # Errors
    /// Returns a [`SessionError`] if the session encounters a fatal error and ends.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.state.transition_running();
        if self.previously_run {
            log::error!("Session re-use is not currently supported. Ending session.");
            return Err(SessionErrorKind::InvalidState(
                "Session re-use is not currently supported".to_string(),
            )
            .into());
        }
        self.previously_run = true;
        self.ack_tracker.reset();

        let cancel_token = CancellationToken::new();
        tokio::spawn({
            let cancel_token = cancel_token.clone();
            let client = self.client.clone();
            let ack_tracker = Arc::clone(&self.ack_tracker);
            let authentication_method = self.authentication_method.clone();
            let credential_refresh_provider = self.credential_refresh_provider.take();
            run_background(
                client,
                ack_tracker,
                authentication_method,
                credential_refresh_provider,
                cancel_token,
            )
        });

        let mut prev_connected = false;
        let mut prev_reconnect_attempts = 0;
        let mut result = Ok(());

        loop {
            let next = tokio::select! {
                biased;
                () = self.notify_force_exit.notified() => { break },
                next = self.event_loop.poll() => { next },
            };

            match next {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    self.state.transition_connected();
                    prev_reconnect_attempts = 0;
                    log::debug!("Incoming CONNACK: {connack:?}");

                    if prev_connected && !connack.session_present {
                        log::error!(
                            "Session state not present on broker after reconnect. Ending session."
                        );
                        result = Err(SessionErrorKind::SessionLost);
                        self.trigger_session_exit().await;
                    } else {
                        prev_connected = true;
                        self.event_loop.set_clean_start(false);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    log::debug!("Incoming PUB: {publish:?}");
                    if publish.dup && self.ack_tracker.contains(&publish) {
                        log::debug!("Duplicate PUB received for PUB already owned. Discarding.");
                        continue;
                    }

                    let targets = {
                        let mut dispatcher = self.incoming_pub_dispatcher.lock().unwrap();
                        dispatcher.dispatch_targets(&publish)
                    };
                    match targets {
                        Ok(targets) => {
                            let mut num_dispatches = 0;
                            for tx in &targets {
                                if tx.send(publish.clone()).await.is_ok() {
                                    num_dispatches += 1;
                                }
                            }
                            if num_dispatches == 0 {
                                log::warn!("All dispatch targets closed. Auto-acking.");
                                self.spawn_auto_ack(publish);
                            } else {
                                match self.ack_tracker.register_pending(&publish, num_dispatches) {
                                    Ok(()) => log::debug!(
                                        "Dispatched PUB to {num_dispatches} receivers. Waiting for acks"
                                    ),
                                    Err(RegisterError::AlreadyRegistered(_)) => {
                                        unreachable!(
                                            "Already checked that the ack tracker does not contain the publish"
                                        );
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("Error dispatching PUB. Will auto-ack. Reason: {e:?}");
                            self.spawn_auto_ack(publish);
                        }
                    }
                }
                Ok(_e) => {
                    // There could be additional incoming and outgoing event responses here if
                    // more filters like the above one are applied
                }
                Err(ConnectionError::MqttState(_)) if self.state.desire_exit() => {
                    self.state.transition_disconnected();
                    break;
                }
                Err(ConnectionError::ConnectionRefused(rc)) => {
                    log::error!("Connection Refused: rc: {rc:?}");
                    result = Err(SessionErrorKind::ConnectionError(next.unwrap_err()));
                    break;
                }
                Err(e) => {
                    self.state.transition_disconnected();
                    log::error!("Error: {e:?}");

                    if let Some(delay) = self
                        .reconnect_policy
                        .next_reconnect_delay(prev_reconnect_attempts, &e)
                    {
                        log::info!("Attempting reconnect in {delay:?}");
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.notify_force_exit.notified() => {
                                log::info!("Reconnect attempts halted by force exit");
                                result = Err(SessionErrorKind::ForceExit);
                                break;
                            }
                        }
                    } else {
                        log::info!("Reconnect attempts halted by reconnect policy");
                        result = Err(SessionErrorKind::ReconnectHalted);
                        break;
                    }
                    prev_reconnect_attempts += 1;
                }
            }
        }
        self.state.transition_exited();
        cancel_token.cancel();
        result.map_err(std::convert::Into::into)
    }

    /// Ack a publish on a background task, so as not to block the event loop.
    fn spawn_auto_ack(&self, publish: crate::control_packet::Publish) {
        let client = self.client.clone();
        tokio::spawn(async move {
            match MqttAck::ack(&client, &publish).await {
                Ok(_) => log::debug!("Auto-ack successful"),
                Err(e) => {
                    log::error!("Auto-ack failed. Publish may be redelivered. Reason: {e:?}");
                }
            }
        });
    }

    /// Helper for triggering a session exit and logging the result
    async fn trigger_session_exit(&self) {
        let exit_handle = self.get_session_exit_handle();
        match exit_handle.trigger_exit_internal().await {
            Ok(()) => log::debug!("Internal session exit successful"),
            Err(e) => log::debug!("Internal session exit failed: {e:?}"),
        }
    }
}

/// Run background tasks for [`Session::run()`]: acking publishes once they're ready, and
/// periodically renewing enhanced authentication credentials if configured.
async fn run_background(
    client: adapter::ClientAlias,
    ack_tracker: Arc<AckTracker>,
    authentication_method: Option<String>,
    credential_refresh_provider: Option<Box<dyn CredentialRefreshProvider>>,
    cancel_token: CancellationToken,
) {
    async fn ack_ready_publishes(ack_tracker: Arc<AckTracker>, acker: adapter::ClientAlias) -> ! {
        loop {
            let publish = ack_tracker.next_ready().await;
            match MqttAck::ack(&acker, &publish).await {
                Ok(_) => log::debug!("Sent ACK for PKID {}", publish.pkid),
                Err(e) => log::error!("ACK failed for PKID {}: {e:?}", publish.pkid),
            }
        }
    }

    match (authentication_method, credential_refresh_provider) {
        (Some(method), Some(provider)) => {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    log::debug!("Session background task cancelled");
                }
                () = ack_ready_publishes(ack_tracker, client.clone()) => {
                    log::error!("`ack_ready_publishes` task ended unexpectedly.");
                }
                () = crate::session::credential_refresh::run_refresh_loop(provider.as_ref(), &method, &client) => {
                    log::error!("credential refresh task ended unexpectedly.");
                }
            }
        }
        _ => {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    log::debug!("Session background task cancelled");
                }
                () = ack_ready_publishes(ack_tracker, client) => {
                    log::error!("`ack_ready_publishes` task ended unexpectedly.");
                }
            }
        }
    }
}

/// Handle used to end an MQTT session.
///
/// PLEASE NOTE WELL
/// This struct's API is designed around negotiating a graceful exit with the MQTT broker.
/// However, this is not actually possible right now due to a bug in underlying MQTT library.
#[derive(Clone)]
pub struct SessionExitHandle {
    disconnector: adapter::ClientAlias,
    state: Arc<SessionState>,
    force_exit: Arc<Notify>,
}

impl SessionExitHandle {
    /// Attempt to gracefully end the MQTT session running in the [`Session`] that created this handle.
    /// This will cause the [`Session::run()`] method to return.
    ///
    /// Note that a graceful exit requires the [`Session`] to be connected to the broker.
    /// If the [`Session`] is not connected, this method will return an error.
    ///
    /// # Errors
    /// * [`SessionExitError::BrokerUnavailable`] if the Session is not connected to the broker.
    pub async fn try_exit(&self) -> Result<(), SessionExitError> {
        log::debug!("Attempting to exit session gracefully");
        if !self.state.is_connected() {
            return Err(SessionExitError::BrokerUnavailable { attempted: false });
        }
        self.trigger_exit_user().await?;
        tokio::select! {
            () = self.state.condition_exited() => Ok(()),
            () = self.state.condition_disconnected() => Err(SessionExitError::BrokerUnavailable { attempted: true }),
        }
    }

    /// Attempt to gracefully end the MQTT session, failing if it does not complete within `timeout`.
    ///
    /// # Errors
    /// * [`SessionExitError::BrokerUnavailable`] if the Session is not connected to the broker.
    /// * [`SessionExitError::Timeout`] if the graceful exit attempt does not complete within `timeout`.
    pub async fn try_exit_timeout(&self, timeout: Duration) -> Result<(), SessionExitError> {
        tokio::time::timeout(timeout, self.try_exit())
            .await
            .unwrap_or(Err(SessionExitError::Timeout))
    }

    /// Forcefully end the MQTT session running in the [`Session`] that created this handle.
    ///
    /// The [`Session`] will be granted a period of 1 second to attempt a graceful exit before
    /// forcing the exit. If the exit is forced, the broker will not be aware the MQTT session
    /// has ended.
    ///
    /// Returns true if the exit was graceful, and false if the exit was forced.
    pub async fn exit_force(&self) -> bool {
        log::debug!("Attempting to exit session gracefully before force exiting");
        let _ = self.trigger_exit_user().await;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                log::debug!("Grace period for graceful session exit expired. Force exiting session");
                self.force_exit.notify_one();
                false
            },
            () = self.state.condition_exited() => {
                log::debug!("Session exited gracefully without need for force exit");
                true
            }
        }
    }

    async fn trigger_exit_user(&self) -> Result<(), SessionExitError> {
        self.state.transition_user_desire_exit();
        MqttDisconnect::disconnect(&self.disconnector).await?;
        Ok(())
    }

    async fn trigger_exit_internal(&self) -> Result<(), SessionExitError> {
        self.state.transition_session_desire_exit();
        MqttDisconnect::disconnect(&self.disconnector).await?;
        Ok(())
    }
}

/// Error attempting to end a [`Session`] via a [`SessionExitHandle`].
#[derive(Debug, Error)]
pub enum SessionExitError {
    /// The broker could not be reached to negotiate a graceful exit.
    #[error("broker unavailable to negotiate session exit (attempted: {attempted})")]
    BrokerUnavailable {
        /// Whether the exit attempt was actually sent to the broker before failing
        attempted: bool,
    },
    /// The disconnect request failed.
    #[error(transparent)]
    Disconnect(#[from] DisconnectError),
    /// The graceful exit attempt did not complete within the given timeout.
    #[error("graceful session exit timed out")]
    Timeout,
}
