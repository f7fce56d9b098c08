use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::AuthData;
use crate::connection::{Command, CommandSender};
use crate::crypto::Decryptor;
use crate::error::PusherError;
use crate::event::{EventDispatcher, ListenerId, PusherEvent};
use crate::message::{
    self, MEMBER_ADDED, MEMBER_REMOVED, PusherMessage, SUBSCRIPTION_COUNT, SUBSCRIPTION_SUCCEEDED,
};
use crate::presence::{Member, Members, member_id};

pub const PRIVATE_ENCRYPTED_PREFIX: &str = "private-encrypted-";
pub const PRESENCE_PREFIX: &str = "presence-";
pub const PRIVATE_PREFIX: &str = "private-";

/// Trust level of a channel, fixed by its name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
    PrivateEncrypted,
}

impl ChannelKind {
    /// Classify a channel name; the most specific prefix wins
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRIVATE_ENCRYPTED_PREFIX) {
            Self::PrivateEncrypted
        } else if name.starts_with(PRESENCE_PREFIX) {
            Self::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            Self::Private
        } else {
            Self::Public
        }
    }

    pub fn is_public(self) -> bool {
        self == Self::Public
    }

    /// Private, presence and encrypted channels all require authorization
    pub fn is_private(self) -> bool {
        !self.is_public()
    }

    pub fn is_presence(self) -> bool {
        self == Self::Presence
    }

    pub fn is_encrypted(self) -> bool {
        self == Self::PrivateEncrypted
    }
}

/// Point-in-time view of a channel, published to every [`Channel`] handle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatus {
    pub subscribed: bool,
    pub subscription_count: Option<u64>,
    pub user_id: Option<String>,
    /// The local user's entry on a presence channel
    pub me: Option<Member>,
    pub members: Members,
}

/// What a channel needs from the connection that owns it
pub(crate) trait ChannelContext {
    fn is_connected(&self) -> bool;
    fn socket_id(&self) -> Option<&str>;
    fn send(&mut self, message: &PusherMessage) -> Result<(), PusherError>;
    fn request_auth(&mut self, channel_name: &str, socket_id: &str);
    fn decryptor(&self) -> &dyn Decryptor;
}

/// Subscription lifecycle
pub(crate) trait Subscribable {
    fn subscribe(&mut self, ctx: &mut dyn ChannelContext, force: bool);
    fn unsubscribe(&mut self, ctx: &mut dyn ChannelContext);
    fn apply_auth(
        &mut self,
        ctx: &mut dyn ChannelContext,
        socket_id: &str,
        result: Result<AuthData, PusherError>,
    );
}

/// Client event origination
pub(crate) trait Triggerable {
    fn trigger(&mut self, ctx: &mut dyn ChannelContext, event: &str, data: Value);
}

/// Presence membership tracking
pub(crate) trait MemberAware {
    fn members(&self) -> Option<&Members>;
    fn me(&self) -> Option<Member>;
    fn apply_member_added(&mut self, data: &Value) -> Option<Member>;
    fn apply_member_removed(&mut self, data: &Value) -> Option<Member>;
}

/// Payload decryption for encrypted channels
pub(crate) trait Decryptable {
    fn decrypt(&self, decryptor: &dyn Decryptor, data: &Value) -> Result<Value, PusherError>;
}

/// Live state of one channel, owned by the channel registry
pub(crate) struct ChannelState {
    name: String,
    kind: ChannelKind,
    subscribed: bool,
    auth_pending: bool,
    subscription_count: Option<u64>,
    auth: Option<AuthData>,
    /// `Some` only on presence channels
    members: Option<Members>,
    dispatcher: EventDispatcher,
    status: watch::Sender<ChannelStatus>,
}

impl ChannelState {
    pub fn new(name: &str) -> Self {
        let kind = ChannelKind::from_name(name);
        let (status, _) = watch::channel(ChannelStatus::default());
        Self {
            name: name.to_string(),
            kind,
            subscribed: false,
            auth_pending: false,
            subscription_count: None,
            auth: None,
            members: kind.is_presence().then(Members::new),
            dispatcher: EventDispatcher::new(),
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn user_id(&self) -> Option<&str> {
        self.auth.as_ref().and_then(AuthData::user_id)
    }

    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    pub fn watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Forget subscription state after the socket is gone
    pub fn reset(&mut self) {
        self.subscribed = false;
        self.auth_pending = false;
        if let Some(members) = self.members.as_mut() {
            members.clear();
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(ChannelStatus {
            subscribed: self.subscribed,
            subscription_count: self.subscription_count,
            user_id: self.user_id().map(str::to_string),
            me: self.me(),
            members: self.members().cloned().unwrap_or_default(),
        });
    }

    fn emit(&self, event: &str, data: Value) {
        self.dispatcher
            .dispatch(&PusherEvent::new(event, Some(self.name.clone()), data));
    }

    fn emit_error(&self, data: Value) {
        self.emit(message::ERROR, data);
    }

    fn send_subscribe(&mut self, ctx: &mut dyn ChannelContext) {
        let frame = match self.auth.as_ref() {
            Some(auth) => {
                message::subscribe_frame(&self.name, Some((&auth.auth, auth.channel_data.as_deref())))
            }
            None => message::subscribe_frame(&self.name, None),
        };
        if let Err(e) = ctx.send(&frame) {
            warn!("Failed to send subscribe for {}: {}", self.name, e);
        }
    }

    /// Route one inbound frame addressed to this channel
    pub fn handle_event(&mut self, ctx: &mut dyn ChannelContext, message: PusherMessage) {
        let internal = message.is_internal();
        let PusherMessage {
            event,
            data,
            user_id,
            ..
        } = message;

        let data = match event.as_str() {
            SUBSCRIPTION_SUCCEEDED => {
                debug!("Subscription succeeded for channel: {}", self.name);
                self.subscribed = true;
                self.auth_pending = false;
                if let Some(members) = self.members.as_mut() {
                    members.load_roster(&data);
                }
                self.publish();
                data
            }
            SUBSCRIPTION_COUNT => {
                self.subscription_count = data.get("subscription_count").and_then(Value::as_u64);
                self.publish();
                data
            }
            MEMBER_ADDED if self.kind.is_presence() => {
                if self.apply_member_added(&data).is_none() {
                    warn!("Ignoring malformed member_added on {}", self.name);
                    return;
                }
                data
            }
            MEMBER_REMOVED if self.kind.is_presence() => {
                if self.apply_member_removed(&data).is_none() {
                    debug!("member_removed for unknown member on {}", self.name);
                    return;
                }
                data
            }
            name if self.kind.is_encrypted() && !internal => {
                match self.decrypt(ctx.decryptor(), &data) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!("Dropping {} on {}: {}", name, self.name, e);
                        return;
                    }
                }
            }
            _ => data,
        };

        let mut delivered = PusherEvent::new(event, Some(self.name.clone()), data);
        delivered.user_id = user_id;
        self.dispatcher.dispatch(&delivered);
    }
}

impl Subscribable for ChannelState {
    fn subscribe(&mut self, ctx: &mut dyn ChannelContext, force: bool) {
        let Some(socket_id) = ctx.socket_id().map(str::to_string) else {
            return;
        };
        if !ctx.is_connected() || (self.subscribed && !force) || (self.auth_pending && !force) {
            return;
        }

        if self.kind.is_public() {
            self.send_subscribe(ctx);
            self.subscribed = true;
            self.publish();
        } else {
            debug!("Authorizing {} for socket {}", self.name, socket_id);
            self.subscribed = false;
            self.auth_pending = true;
            ctx.request_auth(&self.name, &socket_id);
        }
    }

    fn unsubscribe(&mut self, ctx: &mut dyn ChannelContext) {
        self.subscribed = false;
        self.auth_pending = false;
        if let Err(e) = ctx.send(&message::unsubscribe_frame(&self.name)) {
            debug!("Unsubscribe for {} not sent: {}", self.name, e);
        }
        self.publish();
    }

    fn apply_auth(
        &mut self,
        ctx: &mut dyn ChannelContext,
        socket_id: &str,
        result: Result<AuthData, PusherError>,
    ) {
        if !self.auth_pending || ctx.socket_id() != Some(socket_id) {
            debug!("Discarding stale auth result for {}", self.name);
            return;
        }
        self.auth_pending = false;

        match result {
            Ok(auth) => {
                if self.kind.is_encrypted() && auth.shared_secret.is_none() {
                    warn!("Auth for {} carried no shared secret", self.name);
                    self.emit_error(json!({
                        "type": "AuthError",
                        "message": "No shared_secret in auth response",
                    }));
                    return;
                }
                self.auth = Some(auth);
                self.publish();
                self.send_subscribe(ctx);
            }
            Err(e) => {
                warn!("Authorization failed for {}: {}", self.name, e);
                let status = match e {
                    PusherError::AuthStatus(status) => Some(status),
                    _ => None,
                };
                self.emit_error(json!({
                    "type": "AuthError",
                    "status": status,
                    "message": e.to_string(),
                }));
            }
        }
    }
}

impl Triggerable for ChannelState {
    fn trigger(&mut self, ctx: &mut dyn ChannelContext, event: &str, data: Value) {
        let rejection = if self.kind.is_encrypted() {
            Some("Client events are not supported on encrypted channels")
        } else if self.kind.is_public() {
            Some("Client events can only be triggered on private and presence channels")
        } else if !self.subscribed {
            Some("Client events can only be triggered on subscribed channels")
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!("Rejected {} on {}: {}", event, self.name, reason);
            self.emit_error(json!({"type": "ClientEventError", "message": reason}));
            return;
        }

        let frame = PusherMessage::new(
            message::client_event_name(event),
            data,
            Some(self.name.clone()),
        );
        if let Err(e) = ctx.send(&frame) {
            self.emit_error(json!({"type": "ClientEventError", "message": e.to_string()}));
        }
    }
}

impl MemberAware for ChannelState {
    fn members(&self) -> Option<&Members> {
        self.members.as_ref()
    }

    fn me(&self) -> Option<Member> {
        let user_id = self.user_id()?;
        let members = self.members.as_ref()?;
        Some(
            members
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| Member::new(user_id, Value::Null)),
        )
    }

    fn apply_member_added(&mut self, data: &Value) -> Option<Member> {
        let member = Member::from_event_data(data)?;
        self.members.as_mut()?.upsert(member.clone());
        self.publish();
        Some(member)
    }

    fn apply_member_removed(&mut self, data: &Value) -> Option<Member> {
        let id = member_id(data)?;
        let removed = self.members.as_mut()?.remove(&id)?;
        self.publish();
        Some(removed)
    }
}

impl Decryptable for ChannelState {
    fn decrypt(&self, decryptor: &dyn Decryptor, data: &Value) -> Result<Value, PusherError> {
        let shared_secret = self
            .auth
            .as_ref()
            .and_then(|auth| auth.shared_secret.as_deref())
            .ok_or_else(|| PusherError::DecryptionError("no shared secret".to_string()))?;
        decryptor.decrypt(shared_secret, data)
    }
}

/// Application-facing handle to a channel.
///
/// Handles are cheap to clone. After the channel is unsubscribed the handle
/// no longer tracks it; obtain a fresh one from the client.
#[derive(Clone)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    commands: CommandSender,
    status: watch::Receiver<ChannelStatus>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        commands: CommandSender,
        status: watch::Receiver<ChannelStatus>,
    ) -> Self {
        Self {
            kind: ChannelKind::from_name(&name),
            name,
            commands,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_public(&self) -> bool {
        self.kind.is_public()
    }

    pub fn is_private(&self) -> bool {
        self.kind.is_private()
    }

    pub fn is_presence(&self) -> bool {
        self.kind.is_presence()
    }

    pub fn is_encrypted(&self) -> bool {
        self.kind.is_encrypted()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.status.borrow().subscribed
    }

    pub fn subscription_count(&self) -> Option<u64> {
        self.status.borrow().subscription_count
    }

    pub fn user_id(&self) -> Option<String> {
        self.status.borrow().user_id.clone()
    }

    /// Current presence members; empty on other channel kinds
    pub fn members(&self) -> Vec<Member> {
        self.status.borrow().members.iter().cloned().collect()
    }

    /// The local user's member entry on a presence channel
    pub fn me(&self) -> Option<Member> {
        self.status.borrow().me.clone()
    }

    /// Wait until the server has acknowledged the subscription
    pub async fn wait_subscribed(&self) -> Result<(), PusherError> {
        let mut status = self.status.clone();
        status
            .wait_for(|status| status.subscribed)
            .await
            .map(|_| ())
            .map_err(|_| PusherError::ChannelClosed(self.name.clone()))
    }

    fn send(&self, command: Command) -> Result<(), PusherError> {
        self.commands
            .send(command)
            .map_err(|_| PusherError::ChannelClosed(self.name.clone()))
    }

    /// Request a subscription. Completion is signalled by
    /// `pusher:subscription_succeeded` or observed with [`Channel::wait_subscribed`].
    pub fn subscribe(&self) -> Result<(), PusherError> {
        self.send(Command::Subscribe {
            name: self.name.clone(),
            reply: None,
        })
    }

    /// Leave the channel; its listeners are dropped with it
    pub fn unsubscribe(&self) -> Result<(), PusherError> {
        self.send(Command::Unsubscribe {
            name: self.name.clone(),
        })
    }

    /// Send a client event. Rejections arrive as a channel `pusher:error`.
    pub fn trigger(&self, event: &str, data: Value) -> Result<(), PusherError> {
        self.send(Command::Trigger {
            channel: self.name.clone(),
            event: event.to_string(),
            data,
        })
    }

    /// Listen for an event on this channel. Ignored once the channel has
    /// been unsubscribed.
    pub fn bind<F>(&self, event: &str, listener: F) -> Result<ListenerId, PusherError>
    where
        F: Fn(&PusherEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.send(Command::Bind {
            channel: Some(self.name.clone()),
            event: event.to_string(),
            id,
            listener: Arc::new(listener),
        })?;
        Ok(id)
    }

    pub fn unbind(&self, event: &str) -> Result<(), PusherError> {
        self.send(Command::Unbind {
            channel: Some(self.name.clone()),
            event: event.to_string(),
        })
    }

    pub fn unbind_listener(&self, id: ListenerId) -> Result<(), PusherError> {
        self.send(Command::UnbindListener {
            channel: Some(self.name.clone()),
            id,
        })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NONCE_LEN, SecretBoxDecryptor, encrypt_payload};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeContext {
        connected: bool,
        socket_id: Option<String>,
        sent: Vec<PusherMessage>,
        auth_requests: Vec<(String, String)>,
    }

    impl FakeContext {
        fn connected() -> Self {
            Self {
                connected: true,
                socket_id: Some("123.456".to_string()),
                ..Self::default()
            }
        }
    }

    impl ChannelContext for FakeContext {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn socket_id(&self) -> Option<&str> {
            self.socket_id.as_deref()
        }

        fn send(&mut self, message: &PusherMessage) -> Result<(), PusherError> {
            if !self.connected {
                return Err(PusherError::NotConnected);
            }
            self.sent.push(message.clone());
            Ok(())
        }

        fn request_auth(&mut self, channel_name: &str, socket_id: &str) {
            self.auth_requests
                .push((channel_name.to_string(), socket_id.to_string()));
        }

        fn decryptor(&self) -> &dyn Decryptor {
            &SecretBoxDecryptor
        }
    }

    fn record(channel: &mut ChannelState, event: &str) -> Arc<Mutex<Vec<PusherEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.dispatcher_mut().bind(
            event,
            Arc::new(move |e: &PusherEvent| sink.lock().unwrap().push(e.clone())),
        );
        seen
    }

    fn inbound(event: &str, channel: &str, data: Value) -> PusherMessage {
        PusherMessage::new(event, data, Some(channel.to_string()))
    }

    #[test]
    fn most_specific_prefix_wins() {
        assert_eq!(ChannelKind::from_name("my-channel"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("private-orders"), ChannelKind::Private);
        assert_eq!(ChannelKind::from_name("presence-room"), ChannelKind::Presence);
        assert_eq!(
            ChannelKind::from_name("private-encrypted-vault"),
            ChannelKind::PrivateEncrypted
        );
        assert_eq!(ChannelKind::from_name("client-foo"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("Private-orders"), ChannelKind::Public);
        assert!(ChannelKind::PrivateEncrypted.is_private());
        assert!(ChannelKind::Presence.is_private());
    }

    #[test]
    fn public_subscribe_is_immediate() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("my-channel");
        channel.subscribe(&mut ctx, false);

        assert!(channel.is_subscribed());
        assert_eq!(ctx.sent, vec![message::subscribe_frame("my-channel", None)]);

        channel.subscribe(&mut ctx, false);
        assert_eq!(ctx.sent.len(), 1);
        channel.subscribe(&mut ctx, true);
        assert_eq!(ctx.sent.len(), 2);
    }

    #[test]
    fn subscribe_without_socket_id_is_a_no_op() {
        let mut ctx = FakeContext {
            connected: true,
            ..FakeContext::default()
        };
        let mut channel = ChannelState::new("my-channel");
        channel.subscribe(&mut ctx, false);

        assert!(!channel.is_subscribed());
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn private_subscribe_waits_for_auth_and_acknowledgement() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-orders");
        channel.subscribe(&mut ctx, false);

        assert!(ctx.sent.is_empty());
        assert_eq!(
            ctx.auth_requests,
            vec![("private-orders".to_string(), "123.456".to_string())]
        );

        let auth = AuthData::from_response(r#"{"auth":"key:sig"}"#).unwrap();
        channel.apply_auth(&mut ctx, "123.456", Ok(auth));
        assert_eq!(
            ctx.sent,
            vec![message::subscribe_frame(
                "private-orders",
                Some(("key:sig", None))
            )]
        );
        assert!(!channel.is_subscribed());

        channel.handle_event(&mut ctx, inbound(SUBSCRIPTION_SUCCEEDED, "private-orders", json!({})));
        assert!(channel.is_subscribed());
    }

    #[test]
    fn failed_auth_emits_channel_error() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-orders");
        let errors = record(&mut channel, message::ERROR);

        channel.subscribe(&mut ctx, false);
        channel.apply_auth(&mut ctx, "123.456", Err(PusherError::AuthStatus(403)));

        assert!(!channel.is_subscribed());
        assert!(ctx.sent.is_empty());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].data["status"], 403);
    }

    #[test]
    fn stale_auth_result_is_ignored() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-orders");
        channel.subscribe(&mut ctx, false);

        ctx.socket_id = Some("999.999".to_string());
        let auth = AuthData::from_response(r#"{"auth":"key:sig"}"#).unwrap();
        channel.apply_auth(&mut ctx, "123.456", Ok(auth));
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn trigger_requires_subscription_and_prefixes_event() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-chat");
        let errors = record(&mut channel, message::ERROR);

        channel.trigger(&mut ctx, "typing", json!({"who": "me"}));
        assert!(ctx.sent.is_empty());
        assert_eq!(errors.lock().unwrap().len(), 1);

        channel.handle_event(&mut ctx, inbound(SUBSCRIPTION_SUCCEEDED, "private-chat", json!({})));
        channel.trigger(&mut ctx, "typing", json!({"who": "me"}));
        assert_eq!(
            ctx.sent,
            vec![PusherMessage::new(
                "client-typing",
                json!({"who": "me"}),
                Some("private-chat".to_string())
            )]
        );
    }

    #[test]
    fn encrypted_and_public_channels_reject_trigger() {
        let mut ctx = FakeContext::connected();
        for name in ["private-encrypted-vault", "news"] {
            let mut channel = ChannelState::new(name);
            channel.subscribed = true;
            let errors = record(&mut channel, message::ERROR);
            channel.trigger(&mut ctx, "client-x", Value::Null);
            assert_eq!(errors.lock().unwrap().len(), 1, "{} accepted a trigger", name);
        }
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn presence_membership_updates_are_idempotent() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("presence-room");
        let added = json!({"user_id": "42", "user_info": {"name": "Bob"}});

        channel.handle_event(&mut ctx, inbound(MEMBER_ADDED, "presence-room", added.clone()));
        channel.handle_event(&mut ctx, inbound(MEMBER_ADDED, "presence-room", added));
        assert_eq!(channel.members().unwrap().len(), 1);

        channel.handle_event(&mut ctx, inbound(MEMBER_REMOVED, "presence-room", json!({"user_id": "42"})));
        channel.handle_event(&mut ctx, inbound(MEMBER_REMOVED, "presence-room", json!({"user_id": "42"})));
        assert!(channel.members().unwrap().is_empty());
        assert!(channel.watch().borrow().members.is_empty());
    }

    #[test]
    fn me_is_derived_from_user_id() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("presence-room");
        assert!(channel.me().is_none());

        channel.subscribe(&mut ctx, false);
        let auth = AuthData::from_response(
            &json!({"auth": "k:s", "channel_data": "{\"user_id\":\"7\",\"user_info\":{\"name\":\"Al\"}}"})
                .to_string(),
        )
        .unwrap();
        channel.apply_auth(&mut ctx, "123.456", Ok(auth));
        channel.handle_event(
            &mut ctx,
            inbound(
                SUBSCRIPTION_SUCCEEDED,
                "presence-room",
                json!({"presence": {"ids": ["7"], "hash": {"7": {"name": "Al"}}, "count": 1}}),
            ),
        );

        let me = channel.me().unwrap();
        assert_eq!(me.id, "7");
        assert_eq!(me.info, json!({"name": "Al"}));
    }

    #[test]
    fn encrypted_events_are_decrypted_or_dropped() {
        let secret = STANDARD.encode([4u8; 32]);
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-encrypted-vault");
        let seen = record(&mut channel, "secret");

        channel.subscribe(&mut ctx, false);
        let auth = AuthData::from_response(
            &json!({"auth": "k:s", "shared_secret": secret}).to_string(),
        )
        .unwrap();
        channel.apply_auth(&mut ctx, "123.456", Ok(auth));

        let sealed = encrypt_payload(&secret, &[2u8; NONCE_LEN], br#"{"code":1234}"#).unwrap();
        channel.handle_event(&mut ctx, inbound("secret", "private-encrypted-vault", sealed));
        channel.handle_event(&mut ctx, inbound("secret", "private-encrypted-vault", json!("plain")));
        channel.handle_event(&mut ctx, inbound("secret", "private-encrypted-vault", json!({"nonce": "AAAA"})));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, json!({"code": 1234}));
    }

    #[test]
    fn encrypted_subscribe_requires_shared_secret() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-encrypted-vault");
        let errors = record(&mut channel, message::ERROR);

        channel.subscribe(&mut ctx, false);
        let auth = AuthData::from_response(r#"{"auth":"k:s"}"#).unwrap();
        channel.apply_auth(&mut ctx, "123.456", Ok(auth));

        assert!(ctx.sent.is_empty());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn protocol_events_on_encrypted_channels_skip_decryption() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-encrypted-vault");
        let seen = record(&mut channel, "pusher:cache_miss");

        channel.handle_event(
            &mut ctx,
            inbound("pusher:cache_miss", "private-encrypted-vault", json!({"ttl": 3})),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, json!({"ttl": 3}));
    }

    #[test]
    fn subscription_count_is_tracked() {
        let mut ctx = FakeContext::connected();
        let mut channel = ChannelState::new("private-orders");
        channel.handle_event(
            &mut ctx,
            inbound(SUBSCRIPTION_COUNT, "private-orders", json!({"subscription_count": 12})),
        );
        assert_eq!(channel.watch().borrow().subscription_count, Some(12));
    }
}
