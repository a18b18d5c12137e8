//! Plugin session.
//!
//! Owns the connection lifecycle, the table of outstanding requests and the
//! subscriber fan-out. Transport events are consumed by a single dispatch
//! task; callers awaiting a request are parked on a oneshot until the
//! matching Ack, Response or Error arrives.

use crate::config::PluginConfig;
use crate::transport::{EventSender, PeerId, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use btp_core::{
    BtpUri, Codec, ConnectionState, CustomData, Decoded, EncodeError, ErrorKind, Fulfillment,
    IncomingEvent, LedgerError, LpiEvent, Message, RejectionDescriptor, ResponseData, Transfer,
    UriError, WireMessage,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// `info` selector for the account address.
const ACCOUNT_INFO: u8 = 0;
/// `info` selector for the ledger description.
const LEDGER_INFO: u8 = 2;
const EVENT_CAPACITY: usize = 256;

type Outcome = Result<ResponseData, LedgerError>;

/// Error from a plugin operation.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    InvalidUri(#[from] UriError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer answered with an Error packet.
    #[error(transparent)]
    Rejected(#[from] LedgerError),
    #[error("plugin is not connected")]
    NotConnected,
    #[error("plugin is already {0:?}")]
    AlreadyConnected(ConnectionState),
    #[error("connection lost before the request settled")]
    Disconnected,
    /// The transport reported the link closed while connecting.
    #[error("link closed: {0}")]
    LinkClosed(String),
    #[error("a request handler is already registered")]
    RequestHandlerAlreadyRegistered,
    #[error("unexpected {0} response: {1:?}")]
    UnexpectedResponse(&'static str, ResponseData),
}

impl PluginError {
    /// Event-model kind for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(e) => e.kind,
            Self::RequestHandlerAlreadyRegistered => ErrorKind::RequestHandlerAlreadyRegistered,
            Self::InvalidUri(_) | Self::Encode(_) => ErrorKind::InvalidFields,
            Self::Transport(_)
            | Self::NotConnected
            | Self::AlreadyConnected(_)
            | Self::Disconnected
            | Self::LinkClosed(_) => ErrorKind::Unreachable,
            Self::UnexpectedResponse(..) => ErrorKind::NotAccepted,
        }
    }
}

/// Answers inbound requests.
///
/// At most one handler is registered per plugin. It runs on its own task, so
/// a slow handler does not hold up the dispatch loop.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// `data` is the primary protocol-data payload of the request. The
    /// returned message is sent back as a Response; an error goes back as
    /// an Error packet.
    async fn handle_request(&self, data: Vec<u8>) -> Result<Message, LedgerError>;
}

#[derive(Default)]
struct Session {
    peer_id: Option<PeerId>,
    account: Option<String>,
    info: Option<ResponseData>,
    pending: HashMap<u32, oneshot::Sender<Outcome>>,
    request_handler: Option<Arc<dyn RequestHandler>>,
    dispatcher: Option<JoinHandle<()>>,
    /// Reason from the last `Closed` the transport reported.
    close_reason: Option<String>,
}

struct Inner {
    config: PluginConfig,
    codec: Codec,
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<IncomingEvent>,
}

/// A ledger plugin bound to one connector.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<Inner>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("state", &self.inner.state())
            .field("lpi", &self.inner.codec.version().lpi_version())
            .field("btp", &self.inner.codec.version().btp_version())
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(config: PluginConfig, transport: impl Transport) -> Self {
        let codec = Codec::new(config.version);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                transport: Arc::new(transport),
                session: Mutex::new(Session::default()),
                state,
                events,
            }),
        }
    }

    /// Open the transport and run the handshake.
    ///
    /// Resolves once the account and ledger info are cached and the session
    /// is Connected. On failure the transport is stopped and the session is
    /// back to Disconnected.
    pub async fn connect(&self) -> Result<(), PluginError> {
        let uri: BtpUri = self.inner.config.btp_uri.parse()?;

        let mut claimed = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                claimed = true;
            }
            claimed
        });
        if !claimed {
            return Err(PluginError::AlreadyConnected(self.inner.state()));
        }
        let version = self.inner.codec.version();
        tracing::debug!(%uri, lpi = version.lpi_version(), btp = version.btp_version(), "connecting");
        self.inner.session().close_reason = None;

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&self.inner), rx));
        if let Some(stale) = self.inner.session().dispatcher.replace(dispatcher) {
            stale.abort();
        }

        match self.handshake(&uri, tx).await {
            Ok(()) => {
                tracing::info!(%uri, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%uri, error = %e, "connect failed");
                if let Err(stop) = self.inner.transport.stop().await {
                    tracing::debug!(error = %stop, "transport stop after failed connect");
                }
                self.inner.reset();
                Err(e)
            }
        }
    }

    async fn handshake(&self, uri: &BtpUri, events: EventSender) -> Result<(), PluginError> {
        let mut state = self.inner.state.subscribe();
        self.inner.transport.start(uri, events).await?;

        let reached = *state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| PluginError::Disconnected)?;
        if reached != ConnectionState::Handshaking {
            return Err(self.inner.link_lost());
        }

        let bootstrap = async {
            tokio::try_join!(self.inner.fetch_account(), self.inner.fetch_info())
        };
        let lost = async {
            let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
        };
        let (account, info) = tokio::select! {
            result = bootstrap => match result {
                Ok(cached) => cached,
                Err(_) if self.inner.state() == ConnectionState::Disconnected => {
                    return Err(self.inner.link_lost());
                }
                Err(e) => return Err(e),
            },
            () = lost => return Err(self.inner.link_lost()),
        };

        {
            let mut session = self.inner.session();
            session.account = Some(account);
            session.info = Some(info);
        }
        self.inner.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Close the transport.
    ///
    /// Requests still in flight resolve with [`PluginError::Disconnected`].
    pub async fn disconnect(&self) -> Result<(), PluginError> {
        if self.inner.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let stopped = self.inner.transport.stop().await;
        self.inner.reset();
        tracing::info!("disconnected");
        stopped.map_err(PluginError::from)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Ledger info cached during the handshake.
    pub fn get_info(&self) -> Result<ResponseData, PluginError> {
        self.inner.session().info.clone().ok_or(PluginError::NotConnected)
    }

    /// Account address cached during the handshake.
    pub fn get_account(&self) -> Result<String, PluginError> {
        self.inner.session().account.clone().ok_or(PluginError::NotConnected)
    }

    pub async fn get_balance(&self) -> Result<ResponseData, PluginError> {
        let custom = CustomData::new().with("balance", vec![0u8]);
        self.inner.request(LpiEvent::Request(Message::with_custom(custom))).await
    }

    /// Ask the peer for the fulfillment of a transfer it has executed.
    pub async fn get_fulfillment(&self, transfer_id: &str) -> Result<ResponseData, PluginError> {
        let custom = CustomData::new().with("get_fulfillment", transfer_id);
        self.inner.request(LpiEvent::Request(Message::with_custom(custom))).await
    }

    /// Prepare a transfer on the peer. Resolves on the peer's Ack.
    pub async fn send_transfer(&self, transfer: Transfer) -> Result<(), PluginError> {
        self.inner.request(LpiEvent::Prepare(transfer)).await.map(|_| ())
    }

    pub async fn send_request(&self, message: Message) -> Result<ResponseData, PluginError> {
        self.inner.request(LpiEvent::Request(message)).await
    }

    pub async fn fulfill_condition(
        &self,
        transfer_id: impl Into<String>,
        fulfillment: Fulfillment,
    ) -> Result<(), PluginError> {
        let event = LpiEvent::Fulfill {
            transfer_id: transfer_id.into(),
            fulfillment,
        };
        self.inner.request(event).await.map(|_| ())
    }

    pub async fn reject_incoming_transfer(
        &self,
        transfer_id: impl Into<String>,
        reason: RejectionDescriptor,
    ) -> Result<(), PluginError> {
        let event = LpiEvent::Reject {
            transfer_id: transfer_id.into(),
            reason,
        };
        self.inner.request(event).await.map(|_| ())
    }

    pub fn register_request_handler(&self, handler: impl RequestHandler) -> Result<(), PluginError> {
        let mut session = self.inner.session();
        if session.request_handler.is_some() {
            return Err(PluginError::RequestHandlerAlreadyRegistered);
        }
        session.request_handler = Some(Arc::new(handler));
        Ok(())
    }

    pub fn deregister_request_handler(&self) {
        self.inner.session().request_handler = None;
    }

    /// Receive incoming events.
    ///
    /// A receiver that falls more than a few hundred events behind misses
    /// the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<IncomingEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(?previous, ?next, "state changed");
        }
    }

    /// Error for a link that went away during connect.
    fn link_lost(&self) -> PluginError {
        match self.session().close_reason.take() {
            Some(reason) => PluginError::LinkClosed(reason),
            None => PluginError::Disconnected,
        }
    }

    fn reset(&self) {
        let dispatcher = {
            let mut session = self.session();
            session.peer_id = None;
            session.account = None;
            session.info = None;
            // dropping the senders wakes their callers with Disconnected
            session.pending.clear();
            session.dispatcher.take()
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn fetch_account(&self) -> Result<String, PluginError> {
        let data = self.request(info_request(ACCOUNT_INFO)).await?;
        if let Some(account) = data.as_text() {
            return Ok(account.to_string());
        }
        Err(PluginError::UnexpectedResponse("account", data))
    }

    async fn fetch_info(&self) -> Result<ResponseData, PluginError> {
        self.request(info_request(LEDGER_INFO)).await
    }

    /// Send an event and wait for the message that settles it.
    async fn request(&self, event: LpiEvent) -> Result<ResponseData, PluginError> {
        let message = self.codec.encode(&event)?;
        let request_id = message.request_id;
        let (tx, rx) = oneshot::channel();
        let peer_id = {
            let mut session = self.session();
            let peer_id = session.peer_id.clone().ok_or(PluginError::NotConnected)?;
            session.pending.insert(request_id, tx);
            peer_id
        };

        tracing::debug!(request_id, event = event.name(), %peer_id, "request");
        if let Err(e) = self.transport.send(message, &peer_id).await {
            self.session().pending.remove(&request_id);
            return Err(e.into());
        }

        let outcome = rx.await.map_err(|_| PluginError::Disconnected)?;
        Ok(outcome?)
    }

    /// Send a message nobody waits on.
    async fn send_unsolicited(&self, message: WireMessage) -> Result<(), PluginError> {
        let peer_id = self.session().peer_id.clone().ok_or(PluginError::NotConnected)?;
        self.transport.send(message, &peer_id).await?;
        Ok(())
    }

    fn on_connected(&self, peer_id: PeerId) {
        if self.state() != ConnectionState::Connecting {
            tracing::warn!(%peer_id, state = ?self.state(), "ignoring link outside of connect");
            return;
        }
        tracing::debug!(%peer_id, "link up");
        self.session().peer_id = Some(peer_id);
        self.set_state(ConnectionState::Handshaking);
    }

    fn on_closed(&self, peer_id: &PeerId, reason: &str) {
        tracing::warn!(%peer_id, reason, "link closed");
        {
            // pending requests stay parked; only disconnect() drains them
            let mut session = self.session();
            session.peer_id = None;
            session.account = None;
            session.info = None;
            session.close_reason = Some(reason.to_string());
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_message(self: &Arc<Self>, message: &WireMessage, peer_id: &PeerId) {
        tracing::trace!(
            %peer_id,
            request_id = message.request_id,
            packet = message.packet.type_name(),
            settlement = message.packet.is_settlement(),
            "inbound"
        );
        let account = self.session().account.clone().unwrap_or_default();
        let decoded = match self.codec.decode(message, &account) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(%peer_id, request_id = message.request_id, error = %e, "dropping message");
                return;
            }
        };

        match decoded {
            Decoded::Settlement {
                request_id,
                outcome,
            } => {
                let waiter = self.session().pending.remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        tracing::debug!(request_id, ok = outcome.is_ok(), "settled");
                        let _ = waiter.send(outcome);
                    }
                    None => tracing::debug!(
                        request_id,
                        packet = message.packet.type_name(),
                        "no pending request"
                    ),
                }
            }
            Decoded::Event(event) => self.emit(event),
        }
    }

    fn emit(self: &Arc<Self>, event: IncomingEvent) {
        tracing::debug!(event = event.name(), "incoming");
        if let IncomingEvent::IncomingRequest { request_id, data } = &event {
            let handler = self.session().request_handler.clone();
            if let Some(handler) = handler {
                let inner = Arc::clone(self);
                let (request_id, data) = (*request_id, data.clone());
                tokio::spawn(async move { inner.answer(request_id, handler, data).await });
            }
        }
        // having no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn answer(&self, request_id: u32, handler: Arc<dyn RequestHandler>, data: Vec<u8>) {
        let account = self.session().account.clone().unwrap_or_default();
        let reply = match handler.handle_request(data).await {
            Ok(message) => self
                .codec
                .encode(&LpiEvent::Response {
                    request_id,
                    message,
                })
                .unwrap_or_else(|e| {
                    tracing::warn!(request_id, error = %e, "unencodable handler response");
                    self.codec.encode_error(request_id, ErrorKind::NotAccepted, false, &account)
                }),
            Err(e) => {
                tracing::debug!(request_id, error = %e, "request handler failed");
                self.codec.encode_error(request_id, e.kind, false, &account)
            }
        };
        if let Err(e) = self.send_unsolicited(reply).await {
            tracing::warn!(request_id, error = %e, "failed to answer request");
        }
    }
}

fn info_request(selector: u8) -> LpiEvent {
    LpiEvent::Request(Message::with_custom(CustomData::new().with("info", vec![selector])))
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected { peer_id } => inner.on_connected(peer_id),
            TransportEvent::Message { message, peer_id } => inner.on_message(&message, &peer_id),
            TransportEvent::Closed { peer_id, reason } => inner.on_closed(&peer_id, &reason),
        }
    }
    tracing::debug!("transport event stream ended");
}
