//! Connection sessions.
//!
//! A [`Session`] owns one connection's lifecycle state and executes the
//! effects produced by [`lifecycle::transition`]. Outbound events reach the
//! transport through a single unbounded outbox: direct replies are pushed
//! straight in, room and process-wide broadcasts are piped in by one
//! forwarder task per subscription.
//!
//! Durable writes run on a per-session worker in the order they were
//! issued. Online and offline writes for one user are additionally
//! serialized across sessions and re-checked against the registry, so the
//! stored flag always converges on whether a live connection exists.
//! The worker outlives the session: on close it drains what is queued and
//! exits on its own.

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::ids::{ConnectionHandle, MessageId, UserId};
use crate::lifecycle::{self, Effect, Identity, Input, SessionState};
use crate::model::Reaction;
use crate::registry::Registry;
use crate::room::RoomKey;
use crate::router::{RoomReceiver, Router};
use crate::store::{IdentityStore, MessageStore};
use crate::telemetry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_protocol::{
    ClientEvent, ConnectedPayload, NotificationPayload, ReactPayload, ReadPayload, ServerEvent,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Turns a bearer credential into an identity.
pub trait CredentialVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the credential is rejected.
    fn verify(&self, token: &str) -> Result<Identity>;
}

/// Process-wide state shared by every session.
pub struct Hub {
    registry: Registry,
    router: Router,
    messages: Arc<dyn MessageStore>,
    identities: Arc<dyn IdentityStore>,
    verifier: Arc<dyn CredentialVerifier>,
    /// Held while a user's online flag is checked and written.
    presence_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Hub {
    #[must_use]
    pub fn new(
        router: Router,
        messages: Arc<dyn MessageStore>,
        identities: Arc<dyn IdentityStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            router,
            messages,
            identities,
            verifier,
            presence_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[must_use]
    pub fn messages(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    #[must_use]
    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    #[must_use]
    pub fn verifier(&self) -> &Arc<dyn CredentialVerifier> {
        &self.verifier
    }

    fn presence_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.presence_locks
            .entry(user_id.clone())
            .or_default()
            .clone()
    }

    fn release_presence_lock(&self, user_id: &UserId) {
        self.presence_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Write the user's online flag as the registry sees it now.
    ///
    /// `at` is the disconnect time when the write was queued by a
    /// disconnect; it refreshes `lastSeen` either way.
    async fn sync_presence(&self, user_id: &UserId, at: Option<DateTime<Utc>>) -> Result<()> {
        let lock = self.presence_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            let live = self.registry.is_online(user_id);
            match (live, at) {
                (true, None) => self.identities.set_online(user_id).await,
                (true, Some(at)) => self.identities.touch_last_seen(user_id, at).await,
                (false, Some(at)) => self.identities.set_offline(user_id, at).await,
                (false, None) => {
                    trace!(user = %user_id, "No live connection left, online write skipped");
                    Ok(())
                }
            }
        };
        drop(lock);
        self.release_presence_lock(user_id);
        result
    }
}

/// Receiving end of a session's outbound events.
pub type Outbox = mpsc::UnboundedReceiver<Arc<Envelope>>;

type OutboxSender = mpsc::UnboundedSender<Arc<Envelope>>;

/// A write against the durable stores.
#[derive(Debug)]
enum DurableJob {
    MarkOnline(UserId),
    MarkOffline {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    TouchLastSeen {
        user_id: UserId,
        at: DateTime<Utc>,
    },
    MarkRead {
        message_id: MessageId,
        receipt: ReadPayload,
    },
    AddReaction {
        message_id: MessageId,
        reaction: Reaction,
        notice: ReactPayload,
    },
}

impl DurableJob {
    fn name(&self) -> &'static str {
        match self {
            DurableJob::MarkOnline(_) => "mark_online",
            DurableJob::MarkOffline { .. } => "mark_offline",
            DurableJob::TouchLastSeen { .. } => "touch_last_seen",
            DurableJob::MarkRead { .. } => "mark_read",
            DurableJob::AddReaction { .. } => "add_reaction",
        }
    }

    /// Whether a failure is reported back to the issuing connection.
    fn reports_failure(&self) -> bool {
        matches!(
            self,
            DurableJob::MarkRead { .. } | DurableJob::AddReaction { .. }
        )
    }
}

/// One live connection.
pub struct Session {
    hub: Arc<Hub>,
    handle: ConnectionHandle,
    state: SessionState,
    outbox: OutboxSender,
    forwarders: HashMap<RoomKey, JoinHandle<()>>,
    everyone: Option<JoinHandle<()>>,
    durable: Option<mpsc::UnboundedSender<DurableJob>>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Open a session. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> (Self, Outbox) {
        let handle = ConnectionHandle::next();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (durable, jobs) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_durable(hub.clone(), handle, jobs, outbox.clone()));

        debug!(connection = %handle, "Session opened");

        let session = Self {
            hub,
            handle,
            state: SessionState::Connecting,
            outbox,
            forwarders: HashMap::new(),
            everyone: None,
            durable: Some(durable),
            worker: Some(worker),
        };
        (session, outbox_rx)
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.state.identity()
    }

    /// Whether the lifecycle has reached its terminal state. The transport
    /// should flush the outbox and close.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Verify a credential supplied with the transport handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the credential is rejected; the session is
    /// then closed.
    pub fn authenticate(&mut self, token: &str) -> Result<()> {
        let credential = self.hub.verifier.verify(token);
        self.apply(Input::Credential(credential))
    }

    /// Process one inbound event.
    ///
    /// # Errors
    ///
    /// Returns the error reported to the connection, if the event was
    /// refused. Only [`Error::Auth`] closes the session.
    pub fn handle_event(&mut self, event: ClientEvent) -> Result<()> {
        trace!(connection = %self.handle, event = event.name(), "Inbound event");
        self.apply(Input::Event(event))
    }

    /// Close the session and release its memberships.
    ///
    /// Returns the durable worker, which finishes the writes still queued
    /// and then exits. Awaiting it is optional.
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        if let Err(err) = self.apply(Input::Closed) {
            warn!(connection = %self.handle, error = %err, "Close failed");
        }
        self.shutdown();
        self.worker.take()
    }

    fn apply(&mut self, input: Input) -> Result<()> {
        let previous = std::mem::take(&mut self.state);
        let from = previous.name();
        let (next, effects) = lifecycle::transition(previous, input);
        if from != next.name() {
            debug!(connection = %self.handle, from, to = next.name(), "State changed");
        }
        self.state = next;

        let mut outcome = Ok(());
        for effect in effects {
            if let Err(err) = self.execute(effect) {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    fn execute(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::Verify(token) => {
                let credential = self.hub.verifier.verify(&token);
                return self.apply(Input::Credential(credential));
            }
            Effect::Acknowledge(identity) => {
                info!(
                    connection = %self.handle,
                    user = %identity.user_id,
                    "Connection authenticated"
                );
                self.send(ServerEvent::Connected(ConnectedPayload {
                    connection_id: self.handle.to_string(),
                    user_id: identity.user_id.to_string(),
                    username: identity.username,
                    version: PROTOCOL_VERSION,
                }));
                let rx = self.hub.router.subscribe_everyone();
                self.everyone = Some(self.spawn_forwarder("*", rx));
            }
            Effect::Register(identity) => {
                if let Err(err) =
                    self.hub
                        .registry
                        .register(self.handle, identity.user_id, identity.username)
                {
                    error!(connection = %self.handle, error = %err, "Registry rejected connection");
                    return Err(Error::Server(err.to_string()));
                }
            }
            Effect::JoinRoom(room) => match self.hub.router.join(self.handle, &room) {
                Ok(Some(rx)) => {
                    let forwarder = self.spawn_forwarder(room.as_str(), rx);
                    if let Some(stale) = self.forwarders.insert(room, forwarder) {
                        stale.abort();
                    }
                }
                Ok(None) => {
                    trace!(connection = %self.handle, room = %room, "Already a member");
                }
                Err(err) => return self.refuse(Error::Validation(err.to_string())),
            },
            Effect::MarkOnline(user_id) => self.enqueue(DurableJob::MarkOnline(user_id)),
            Effect::Broadcast {
                room,
                event,
                exclude_self,
            } => {
                let name = event.name();
                let exclude = exclude_self.then_some(self.handle);
                let recipients = self.hub.router.broadcast(&room, event, exclude);
                telemetry::record_fanout(recipients);
                trace!(
                    connection = %self.handle,
                    room = %room,
                    event = name,
                    recipients,
                    "Broadcast"
                );
            }
            Effect::MarkRead {
                message_id,
                receipt,
            } => self.enqueue(DurableJob::MarkRead {
                message_id,
                receipt,
            }),
            Effect::AddReaction {
                message_id,
                reaction,
                notice,
            } => self.enqueue(DurableJob::AddReaction {
                message_id,
                reaction,
                notice,
            }),
            Effect::TouchLastSeen(user_id) => self.enqueue(DurableJob::TouchLastSeen {
                user_id,
                at: Utc::now(),
            }),
            Effect::Disconnect(identity) => self.disconnect(identity),
            Effect::Refuse(err) => return self.refuse(err),
            Effect::Ignore { event, reason } => {
                warn!(connection = %self.handle, event, reason, "Dropped event");
            }
            Effect::Reject(err) => {
                warn!(connection = %self.handle, error = %err, "Connection rejected");
                self.send(ServerEvent::error(err.wire_code(), err.to_string()));
                return Err(err);
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, identity: Identity) {
        let snapshot = self.hub.registry.unregister(self.handle);
        let rooms = self.hub.router.leave_all(self.handle);
        self.stop_forwarders();

        let global = RoomKey::global();
        let mut recipients = self
            .hub
            .router
            .broadcast(&global, ServerEvent::UserLeft(identity.presence()), None);
        recipients += self.hub.router.broadcast(
            &global,
            ServerEvent::GroupNotification(NotificationPayload::left(
                identity.user_id.as_str(),
                identity.username.as_str(),
            )),
            None,
        );
        telemetry::record_fanout(recipients);

        let at = Utc::now();
        match snapshot {
            Some(snapshot) if snapshot.was_last_connection() => {
                self.enqueue(DurableJob::MarkOffline {
                    user_id: identity.user_id.clone(),
                    at,
                });
            }
            Some(_) => self.enqueue(DurableJob::TouchLastSeen {
                user_id: identity.user_id.clone(),
                at,
            }),
            None => {
                warn!(
                    connection = %self.handle,
                    "Disconnecting a connection that was never registered"
                );
            }
        }

        info!(
            connection = %self.handle,
            user = %identity.user_id,
            rooms = rooms.len(),
            "Connection disconnected"
        );
    }

    fn refuse(&self, err: Error) -> Result<()> {
        warn!(connection = %self.handle, error = %err, "Refused event");
        self.send(ServerEvent::error(err.wire_code(), err.to_string()));
        Err(err)
    }

    fn send(&self, event: ServerEvent) {
        if self.outbox.send(Arc::new(Envelope::new(event))).is_err() {
            trace!(connection = %self.handle, "Outbox closed");
        }
    }

    fn enqueue(&self, job: DurableJob) {
        let Some(durable) = &self.durable else {
            warn!(connection = %self.handle, job = job.name(), "Durable worker already stopped");
            return;
        };
        if durable.send(job).is_err() {
            error!(connection = %self.handle, "Durable worker is gone");
        }
    }

    fn spawn_forwarder(&self, label: &str, mut rx: RoomReceiver) -> JoinHandle<()> {
        let handle = self.handle;
        let label = label.to_string();
        let outbox = self.outbox.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if !envelope.is_visible_to(handle) {
                            continue;
                        }
                        if outbox.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection = %handle, room = %label, skipped, "Receiver lagged");
                    }
                }
            }
        })
    }

    fn stop_forwarders(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        if let Some(everyone) = self.everyone.take() {
            everyone.abort();
        }
    }

    fn shutdown(&mut self) {
        self.stop_forwarders();
        self.durable = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            if let Err(err) = self.apply(Input::Closed) {
                warn!(connection = %self.handle, error = %err, "Close on drop failed");
            }
        }
        self.shutdown();
    }
}

async fn run_durable(
    hub: Arc<Hub>,
    handle: ConnectionHandle,
    mut jobs: mpsc::UnboundedReceiver<DurableJob>,
    replies: OutboxSender,
) {
    while let Some(job) = jobs.recv().await {
        let name = job.name();
        let reports_failure = job.reports_failure();

        if let Err(err) = perform(&hub, job).await {
            warn!(connection = %handle, job = name, error = %err, "Durable write failed");
            telemetry::record_persistence_failure(name);
            if reports_failure {
                let notice = ServerEvent::error(err.wire_code(), err.to_string());
                // The connection may already be gone.
                let _ = replies.send(Arc::new(Envelope::new(notice)));
            }
        }
    }
    debug!(connection = %handle, "Durable worker finished");
}

async fn perform(hub: &Hub, job: DurableJob) -> Result<()> {
    match job {
        DurableJob::MarkOnline(user_id) => hub.sync_presence(&user_id, None).await,
        DurableJob::MarkOffline { user_id, at } => hub.sync_presence(&user_id, Some(at)).await,
        DurableJob::TouchLastSeen { user_id, at } => {
            hub.identities.touch_last_seen(&user_id, at).await
        }
        DurableJob::MarkRead {
            message_id,
            receipt,
        } => {
            hub.messages.mark_read(message_id).await?;
            let recipients = hub
                .router
                .broadcast_everyone(ServerEvent::MessageRead(receipt));
            telemetry::record_fanout(recipients);
            Ok(())
        }
        DurableJob::AddReaction {
            message_id,
            reaction,
            notice,
        } => {
            hub.messages.add_reaction(message_id, reaction).await?;
            let recipients = hub
                .router
                .broadcast_everyone(ServerEvent::MessageReacted(notice));
            telemetry::record_fanout(recipients);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityStore, MemoryMessageStore};
    use crate::model::{NewMessage, UserIdentity};
    use huddle_protocol::{
        AuthenticatePayload, JoinPayload, NotificationKind, PrivateMessagePayload, TypingPayload,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct TokenTable(HashMap<String, Identity>);

    impl CredentialVerifier for TokenTable {
        fn verify(&self, token: &str) -> Result<Identity> {
            self.0
                .get(token)
                .cloned()
                .ok_or_else(|| Error::Auth("invalid token".into()))
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        messages: Arc<MemoryMessageStore>,
        identities: Arc<MemoryIdentityStore>,
        alice: UserIdentity,
        bob: UserIdentity,
        carol: UserIdentity,
    }

    async fn fixture() -> Fixture {
        let messages = Arc::new(MemoryMessageStore::new());
        let identities = Arc::new(MemoryIdentityStore::new());
        let alice = identities.create_user("alice", "x").await.unwrap();
        let bob = identities.create_user("bob", "x").await.unwrap();
        let carol = identities.create_user("carol", "x").await.unwrap();

        let tokens = [&alice, &bob, &carol]
            .into_iter()
            .map(|u| {
                (
                    format!("token-{}", u.username),
                    Identity::new(u.id.clone(), u.username.clone()),
                )
            })
            .collect();

        let hub = Arc::new(Hub::new(
            Router::new(),
            messages.clone(),
            identities.clone(),
            Arc::new(TokenTable(tokens)),
        ));
        Fixture {
            hub,
            messages,
            identities,
            alice,
            bob,
            carol,
        }
    }

    async fn next_event(outbox: &mut Outbox) -> ServerEvent {
        timeout(Duration::from_secs(1), outbox.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("outbox closed")
            .event
            .clone()
    }

    async fn next_named(outbox: &mut Outbox, name: &str) -> ServerEvent {
        loop {
            let event = next_event(outbox).await;
            if event.name() == name {
                return event;
            }
        }
    }

    /// Drain everything delivered so far.
    async fn settle(outbox: &mut Outbox) -> Vec<ServerEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(envelope)) = timeout(Duration::from_millis(50), outbox.recv()).await {
            seen.push(envelope.event.clone());
        }
        seen
    }

    async fn join(hub: &Arc<Hub>, user: &UserIdentity) -> (Session, Outbox) {
        let (mut session, mut outbox) = Session::new(hub.clone());
        session
            .authenticate(&format!("token-{}", user.username))
            .unwrap();
        session
            .handle_event(ClientEvent::Join(JoinPayload {
                user_id: user.id.to_string(),
                username: user.username.clone(),
            }))
            .unwrap();
        assert!(matches!(next_event(&mut outbox).await, ServerEvent::Connected(_)));
        (session, outbox)
    }

    #[tokio::test]
    async fn test_join_announces_presence() {
        let f = fixture().await;
        let (_a, mut out_a) = join(&f.hub, &f.alice).await;
        assert_eq!(
            next_event(&mut out_a).await.name(),
            "user-joined",
            "joining user sees its own user-joined"
        );
        settle(&mut out_a).await;

        let (b, mut out_b) = join(&f.hub, &f.bob).await;
        let seen = settle(&mut out_a).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::UserJoined(p) if p.username == "bob")));
        assert!(seen.iter().any(|e| matches!(
            e,
            ServerEvent::GroupNotification(n) if n.kind == NotificationKind::Join
                && n.message == "bob joined the group chat."
        )));

        let own = settle(&mut out_b).await;
        assert!(own
            .iter()
            .all(|e| !matches!(e, ServerEvent::GroupNotification(_))));

        assert!(f.hub.registry().lookup(b.handle()).is_some());
        assert!(f.hub.router().is_member(b.handle(), &RoomKey::global()));
        settle(&mut out_a).await;
        assert!(f.identities.find_user(&f.bob.id).await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn test_group_message_reaches_every_member() {
        let f = fixture().await;
        let (mut a, mut out_a) = join(&f.hub, &f.alice).await;
        let (_b, mut out_b) = join(&f.hub, &f.bob).await;
        settle(&mut out_a).await;
        settle(&mut out_b).await;

        a.handle_event(ClientEvent::SendGroupMessage(json!({"content": "hi"})))
            .unwrap();

        let expected = ServerEvent::ReceiveGroupMessage(json!({"content": "hi"}));
        assert_eq!(next_event(&mut out_b).await, expected);
        assert_eq!(next_event(&mut out_a).await, expected);
        assert!(settle(&mut out_b).await.is_empty());
    }

    #[tokio::test]
    async fn test_typing_excludes_sender() {
        let f = fixture().await;
        let (mut a, mut out_a) = join(&f.hub, &f.alice).await;
        let (_b, mut out_b) = join(&f.hub, &f.bob).await;
        settle(&mut out_a).await;
        settle(&mut out_b).await;

        a.handle_event(ClientEvent::TypingGroup(TypingPayload {
            username: "alice".into(),
        }))
        .unwrap();

        assert_eq!(next_event(&mut out_b).await.name(), "typing-group");
        assert!(settle(&mut out_a).await.is_empty());
    }

    #[tokio::test]
    async fn test_private_room_exchange() {
        let f = fixture().await;
        let (mut a, mut out_a) = join(&f.hub, &f.alice).await;
        let (mut b, mut out_b) = join(&f.hub, &f.bob).await;
        let (_c, mut out_c) = join(&f.hub, &f.carol).await;

        let key_a = RoomKey::private(&f.alice.id, &f.bob.id);
        let key_b = RoomKey::private(&f.bob.id, &f.alice.id);
        assert_eq!(key_a, key_b);

        a.handle_event(ClientEvent::JoinPrivate(key_a.to_string()))
            .unwrap();
        b.handle_event(ClientEvent::JoinPrivate(key_b.to_string()))
            .unwrap();
        settle(&mut out_a).await;
        settle(&mut out_b).await;
        settle(&mut out_c).await;

        a.handle_event(ClientEvent::SendPrivateMessage(PrivateMessagePayload {
            room_id: key_a.to_string(),
            message: json!({"content": "psst"}),
        }))
        .unwrap();

        assert_eq!(
            next_named(&mut out_b, "receive-private-message").await,
            ServerEvent::ReceivePrivateMessage(json!({"content": "psst"}))
        );
        assert!(settle(&mut out_c).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_broadcasts_after_persistence() {
        let f = fixture().await;
        let message = f
            .messages
            .append(NewMessage::text(f.alice.id.clone(), "hello"))
            .await
            .unwrap();

        let (_a, mut out_a) = join(&f.hub, &f.alice).await;
        let (mut b, mut out_b) = join(&f.hub, &f.bob).await;
        settle(&mut out_a).await;
        settle(&mut out_b).await;

        b.handle_event(ClientEvent::ReadMessage(ReadPayload {
            message_id: message.id.to_string(),
            user_id: f.bob.id.to_string(),
        }))
        .unwrap();

        let expected = ServerEvent::MessageRead(ReadPayload {
            message_id: message.id.to_string(),
            user_id: f.bob.id.to_string(),
        });
        assert_eq!(next_named(&mut out_a, "message-read").await, expected);
        assert_eq!(next_named(&mut out_b, "message-read").await, expected);
        assert!(f.messages.get(message.id).await.unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_failed_persistence_is_not_broadcast() {
        let f = fixture().await;
        let (_a, mut out_a) = join(&f.hub, &f.alice).await;
        let (mut b, mut out_b) = join(&f.hub, &f.bob).await;
        settle(&mut out_a).await;
        settle(&mut out_b).await;

        b.handle_event(ClientEvent::ReactMessage(ReactPayload {
            message_id: MessageId::generate().to_string(),
            user_id: f.bob.id.to_string(),
            reaction: "👍".into(),
        }))
        .unwrap();

        match next_event(&mut out_b).await {
            ServerEvent::Error(err) => assert_eq!(err.code, 4004),
            other => panic!("expected an error, got {other:?}"),
        }
        assert!(settle(&mut out_a).await.is_empty());
    }

    #[tokio::test]
    async fn test_reactions_are_persisted_in_order() {
        let f = fixture().await;
        let message = f
            .messages
            .append(NewMessage::text(f.alice.id.clone(), "hello"))
            .await
            .unwrap();
        let (mut a, mut out_a) = join(&f.hub, &f.alice).await;
        settle(&mut out_a).await;

        for reaction in ["👍", "👍", "❤️"] {
            a.handle_event(ClientEvent::ReactMessage(ReactPayload {
                message_id: message.id.to_string(),
                user_id: f.alice.id.to_string(),
                reaction: reaction.into(),
            }))
            .unwrap();
        }
        for _ in 0..3 {
            next_named(&mut out_a, "message-reacted").await;
        }

        let stored = f.messages.get(message.id).await.unwrap().unwrap();
        let reactions: Vec<&str> = stored.reactions.iter().map(|r| r.reaction.as_str()).collect();
        assert_eq!(reactions, vec!["👍", "👍", "❤️"]);
    }

    #[tokio::test]
    async fn test_invalid_credential_never_registers() {
        let f = fixture().await;
        let (mut session, mut outbox) = Session::new(f.hub.clone());

        let err = session.authenticate("forged").unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(session.is_closed());

        let join = session.handle_event(ClientEvent::Join(JoinPayload {
            user_id: f.alice.id.to_string(),
            username: "alice".into(),
        }));
        assert!(join.is_ok());
        assert!(f.hub.registry().lookup(session.handle()).is_none());
        assert!(f.hub.registry().is_empty());

        match next_event(&mut outbox).await {
            ServerEvent::Error(err) => assert_eq!(err.code, 4001),
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_without_credential_rejects() {
        let f = fixture().await;
        let (mut session, _outbox) = Session::new(f.hub.clone());

        let err = session
            .handle_event(ClientEvent::TypingGroup(TypingPayload {
                username: "alice".into(),
            }))
            .unwrap_err();
        assert_eq!(err, Error::Auth("no token provided".into()));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_in_band_authenticate() {
        let f = fixture().await;
        let (mut session, mut outbox) = Session::new(f.hub.clone());

        session
            .handle_event(ClientEvent::Authenticate(AuthenticatePayload {
                token: "token-alice".into(),
            }))
            .unwrap();
        assert!(matches!(session.state(), SessionState::Authenticated(_)));
        match next_event(&mut outbox).await {
            ServerEvent::Connected(connected) => {
                assert_eq!(connected.user_id, f.alice.id.to_string());
                assert_eq!(connected.connection_id, session.handle().to_string());
            }
            other => panic!("expected connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let f = fixture().await;
        let (a, mut out_a) = join(&f.hub, &f.alice).await;
        let (_b, mut out_b) = join(&f.hub, &f.bob).await;
        let handle = a.handle();
        settle(&mut out_a).await;
        settle(&mut out_b).await;

        if let Some(worker) = a.close() {
            worker.await.unwrap();
        }

        assert!(f.hub.registry().lookup(handle).is_none());
        assert!(f.hub.router().rooms_of(handle).is_empty());
        assert!(!f.hub.router().is_member(handle, &RoomKey::global()));

        let seen = settle(&mut out_b).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::UserLeft(p) if p.username == "alice")));
        assert!(seen.iter().any(|e| matches!(
            e,
            ServerEvent::GroupNotification(n) if n.kind == NotificationKind::Leave
        )));

        let alice = f.identities.find_user(&f.alice.id).await.unwrap().unwrap();
        assert!(!alice.online);
        assert!(alice.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_second_device_keeps_user_online() {
        let f = fixture().await;
        let (phone, _out_phone) = join(&f.hub, &f.alice).await;
        let (laptop, _out_laptop) = join(&f.hub, &f.alice).await;

        if let Some(worker) = phone.close() {
            worker.await.unwrap();
        }
        let alice = f.identities.find_user(&f.alice.id).await.unwrap().unwrap();
        assert!(alice.online);
        assert!(alice.last_seen.is_some());

        if let Some(worker) = laptop.close() {
            worker.await.unwrap();
        }
        assert!(!f.identities.find_user(&f.alice.id).await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn test_drop_without_close_still_cleans_up() {
        let f = fixture().await;
        let (a, _out_a) = join(&f.hub, &f.alice).await;
        let handle = a.handle();
        drop(a);

        assert!(f.hub.registry().lookup(handle).is_none());
        assert!(f.hub.router().rooms_of(handle).is_empty());
    }

    /// Delays every online write.
    struct SlowOnline(Arc<MemoryIdentityStore>);

    #[async_trait::async_trait]
    impl IdentityStore for SlowOnline {
        async fn create_user(&self, username: &str, credential_hash: &str) -> Result<UserIdentity> {
            self.0.create_user(username, credential_hash).await
        }

        async fn find_user(&self, id: &UserId) -> Result<Option<UserIdentity>> {
            self.0.find_user(id).await
        }

        async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>> {
            self.0.find_by_username(username).await
        }

        async fn list_users(&self) -> Result<Vec<UserIdentity>> {
            self.0.list_users().await
        }

        async fn set_online(&self, id: &UserId) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.0.set_online(id).await
        }

        async fn set_offline(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
            self.0.set_offline(id, at).await
        }

        async fn touch_last_seen(&self, id: &UserId, at: DateTime<Utc>) -> Result<()> {
            self.0.touch_last_seen(id, at).await
        }
    }

    #[tokio::test]
    async fn test_slow_online_write_never_outlives_last_connection() {
        let identities = Arc::new(MemoryIdentityStore::new());
        let alice = identities.create_user("alice", "x").await.unwrap();
        let tokens = HashMap::from([(
            "token-alice".to_string(),
            Identity::new(alice.id.clone(), "alice"),
        )]);
        let hub = Arc::new(Hub::new(
            Router::new(),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(SlowOnline(identities.clone())),
            Arc::new(TokenTable(tokens)),
        ));

        let (phone, _out_phone) = join(&hub, &alice).await;
        let (laptop, _out_laptop) = join(&hub, &alice).await;
        let laptop_worker = laptop.close();
        let phone_worker = phone.close();
        for worker in [laptop_worker, phone_worker].into_iter().flatten() {
            worker.await.unwrap();
        }

        assert!(hub.registry().is_empty());
        let stored = identities.find_user(&alice.id).await.unwrap().unwrap();
        assert!(!stored.online, "no live connection, flag must be offline");
        assert!(stored.last_seen.is_some());
        assert!(hub.presence_locks.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_during_offline_write_stays_online() {
        let f = fixture().await;
        let (phone, _out_phone) = join(&f.hub, &f.alice).await;
        let phone_worker = phone.close();
        let (_laptop, _out_laptop) = join(&f.hub, &f.alice).await;
        if let Some(worker) = phone_worker {
            worker.await.unwrap();
        }

        let mut online = false;
        for _ in 0..50 {
            online = f.identities.find_user(&f.alice.id).await.unwrap().unwrap().online;
            if online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(online);
    }
}
