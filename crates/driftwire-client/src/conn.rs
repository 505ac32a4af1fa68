//! DDP connection state machine.
//!
//! Pure state machine over the session: socket events and frames go
//! in, [`Action`]s come out, and the driver does the I/O. Time comes in
//! through the [`Environment`], so reconnect and login-retry deadlines
//! are tick-driven and fully deterministic under test.
//!
//! # Session lifecycle
//!
//! ```text
//! ┌──────────────┐  open   ┌────────────┐  connected{session}  ┌───────────┐
//! │ Disconnected │────────>│ Connecting │─────────────────────>│ Connected │
//! └──────────────┘         └────────────┘                      └───────────┘
//!        ^                                                           │
//!        └───────────────────── socket close ────────────────────────┘
//! ```
//!
//! On `connected`, the previously remembered session id decides
//! everything: a reused session keeps client state authoritative, a
//! cold one clears every non-local collection before the server
//! re-populates. Either way, in-flight state replays ahead of the
//! ordinary queue: pending login calls, then other pending methods in
//! their original order, then one `sub` per live subscription.

use std::sync::Arc;

use driftwire_core::{
    CollectionStore, Dependency, Environment, ReactiveDict, Tracker,
};
use driftwire_proto::{ChangedMessage, ClientMessage, ServerMessage, ejson};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::auth::{
    AuthState, LoginFailureClass, UserSelector, classify, password_digest,
};
use crate::call::{CallRegistry, MethodKind, PendingMethod};
use crate::config::ClientConfig;
use crate::error::DdpError;
use crate::event::{Action, Notice, ResultCallback, SocketEvent};
use crate::queue::MessageQueue;
use crate::storage::{
    KeyStorage, TOKEN_EXPIRES_KEY, TOKEN_KEY, USER_ID_KEY, read_key, write_key,
};
use crate::subscription::{SubCallbacks, SubRecord, SubRegistry};
use crate::vent::VentRegistry;

/// Reactive dictionary key for the logged-in user id.
pub(crate) const DICT_USER_ID: &str = "userId";
/// Reactive dictionary key for the login-in-progress flag.
pub(crate) const DICT_LOGGING_IN: &str = "loggingIn";
/// Reactive dictionary key for the logout-in-progress flag.
pub(crate) const DICT_LOGGING_OUT: &str = "loggingOut";
/// Reactive dictionary key for the token expiry.
pub(crate) const DICT_TOKEN_EXPIRES: &str = "loginTokenExpires";

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No socket, or socket down.
    Disconnected,
    /// Socket open, `connected` not yet received.
    Connecting,
    /// Session established.
    Connected,
}

impl Status {
    /// Lowercase status string for the public API.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// The sans-IO DDP session.
pub struct DdpConn<E: Environment> {
    env: E,
    config: ClientConfig,
    storage: Arc<dyn KeyStorage>,
    tracker: Tracker,
    dict: ReactiveDict,
    store: CollectionStore,
    vents: VentRegistry,

    status: Status,
    /// User intent: `connect()` sets it, `disconnect()` clears it.
    want_connected: bool,
    auto_reconnect: bool,
    session_id: Option<String>,
    reconnect_at: Option<E::Instant>,

    queue: MessageQueue<String>,
    subs: Arc<Mutex<SubRegistry>>,
    calls: CallRegistry,
    auth: AuthState<E::Instant>,
    /// Subscriptions condemned by the after-flush reuse check, stopped
    /// on the next drain.
    pending_stops: Arc<Mutex<Vec<String>>>,
}

impl<E: Environment> DdpConn<E> {
    /// Build a session with its own tracker, store, and dictionary.
    pub fn new(env: E, config: ClientConfig, storage: Arc<dyn KeyStorage>) -> Self {
        let tracker = Tracker::new();
        let store = CollectionStore::new(&tracker);
        let dict = ReactiveDict::new(&tracker);
        Self {
            env,
            config,
            storage,
            tracker,
            dict,
            store,
            vents: VentRegistry::default(),
            status: Status::Disconnected,
            want_connected: false,
            auto_reconnect: false,
            session_id: None,
            reconnect_at: None,
            queue: MessageQueue::new(),
            subs: Arc::default(),
            calls: CallRegistry::default(),
            auth: AuthState::default(),
            pending_stops: Arc::default(),
        }
    }

    /// Shared tracker handle.
    #[must_use]
    pub fn tracker(&self) -> Tracker {
        self.tracker.clone()
    }

    /// Shared store handle.
    #[must_use]
    pub fn store(&self) -> CollectionStore {
        self.store.clone()
    }

    /// Shared reactive dictionary handle.
    #[must_use]
    pub fn dict(&self) -> ReactiveDict {
        self.dict.clone()
    }

    pub(crate) fn vents(&self) -> VentRegistry {
        self.vents.clone()
    }

    /// `(connected, status-string)` pair.
    #[must_use]
    pub fn status(&self) -> (bool, &'static str) {
        (self.status == Status::Connected, self.status.as_str())
    }

    /// Ask for a socket. Arms auto-reconnect per configuration.
    pub fn connect(&mut self) -> Vec<Action> {
        self.want_connected = true;
        self.auto_reconnect = self.config.auto_reconnect;
        self.reconnect_at = None;
        if self.status == Status::Disconnected {
            vec![Action::OpenSocket]
        } else {
            Vec::new()
        }
    }

    /// Drop the socket and disarm reconnection until
    /// [`DdpConn::reconnect`] is called.
    pub fn disconnect(&mut self) -> Vec<Action> {
        self.want_connected = false;
        self.auto_reconnect = false;
        self.reconnect_at = None;
        if self.status == Status::Disconnected {
            Vec::new()
        } else {
            vec![Action::CloseSocket]
        }
    }

    /// Reachability recovered: reconnect immediately instead of
    /// waiting out the interval, when reconnection is armed.
    pub fn network_recovered(&mut self) -> Vec<Action> {
        if self.auto_reconnect && self.want_connected && self.status == Status::Disconnected {
            self.reconnect_at = None;
            vec![Action::OpenSocket]
        } else {
            Vec::new()
        }
    }

    /// The configuration this session runs under.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Re-arm the connection after an explicit `disconnect`.
    pub fn reconnect(&mut self) -> Vec<Action> {
        self.want_connected = true;
        self.auto_reconnect = self.config.auto_reconnect;
        self.reconnect_at = None;
        if self.status == Status::Disconnected {
            vec![Action::OpenSocket]
        } else {
            Vec::new()
        }
    }

    /// Feed a transport event.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> Vec<Action> {
        match event {
            SocketEvent::Opened => {
                self.status = Status::Connecting;
                let frame = ClientMessage::connect(self.session_id.clone()).stringify();
                self.log_frame("out", &frame);
                vec![Action::Send(frame)]
            },
            SocketEvent::Closed => {
                self.status = Status::Disconnected;
                if self.auto_reconnect && self.want_connected {
                    self.reconnect_at = Some(self.env.now() + self.config.reconnect_interval);
                }
                vec![Action::Emit(Notice::Disconnected)]
            },
            SocketEvent::Error { message } => {
                vec![Action::Emit(Notice::SocketError { message })]
            },
            SocketEvent::Frame(text) => self.handle_frame(&text),
        }
    }

    /// Parse and process one inbound frame. Malformed frames are
    /// dropped; the socket stays up.
    pub fn handle_frame(&mut self, text: &str) -> Vec<Action> {
        self.log_frame("in", text);
        match ServerMessage::parse(text) {
            Err(err) => {
                tracing::debug!(%err, "dropping malformed frame");
                Vec::new()
            },
            Ok(None) => Vec::new(),
            Ok(Some(message)) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Vec<Action> {
        match message {
            ServerMessage::Connected { session } => self.handle_connected(session),
            ServerMessage::Failed { version } => {
                let message = match version {
                    Some(version) => format!("server requires DDP version {version}"),
                    None => "server rejected DDP version 1".to_string(),
                };
                tracing::warn!(%message, "version negotiation failed");
                vec![Action::Emit(Notice::ProtocolError { message }), Action::CloseSocket]
            },
            ServerMessage::Ping { id } => {
                let frame = ClientMessage::Pong { id }.stringify();
                self.log_frame("out", &frame);
                vec![Action::Send(frame)]
            },
            ServerMessage::Added { collection, id, fields } => {
                let mut actions: Vec<Action> = self
                    .store
                    .apply_added(&collection, &id, fields)
                    .into_iter()
                    .map(Action::Notify)
                    .collect();
                actions.push(Action::Emit(Notice::Added { collection, id }));
                actions
            },
            ServerMessage::Changed(changed) => self.handle_changed(changed),
            ServerMessage::Removed { collection, id } => {
                let mut actions: Vec<Action> = self
                    .store
                    .apply_removed(&collection, &id)
                    .into_iter()
                    .map(Action::Notify)
                    .collect();
                actions.push(Action::Emit(Notice::Removed { collection, id }));
                actions
            },
            ServerMessage::Ready { subs } => self.handle_ready(&subs),
            ServerMessage::Nosub { id, error } => self.handle_nosub(&id, error),
            ServerMessage::Result { id, result, error } => self.handle_result(&id, result, error),
            ServerMessage::Updated { methods } => {
                self.calls.clear_barrier(&methods);
                Vec::new()
            },
            ServerMessage::Error { reason, .. } => {
                let message = reason.unwrap_or_else(|| "server reported an error".to_string());
                vec![Action::Emit(Notice::ProtocolError { message })]
            },
            ServerMessage::Unknown { msg, .. } => {
                vec![Action::Emit(Notice::ProtocolError {
                    message: format!("unrecognized server message '{msg}'"),
                })]
            },
        }
    }

    fn handle_connected(&mut self, session: String) -> Vec<Action> {
        let session_reused = self.session_id.as_deref() == Some(session.as_str());
        self.session_id = Some(session);
        self.status = Status::Connected;

        let mut actions = Vec::new();
        if !session_reused {
            for dispatch in self.store.clear_remote() {
                actions.push(Action::Notify(dispatch));
            }
        }

        // In-flight replay ahead of the ordinary queue: login methods,
        // then other methods, then subscription re-sends. Frames that
        // never reached the old socket are still in the queue and drain
        // after.
        let mut replay = self.calls.replay_frames();
        {
            let registry = self.subs.lock();
            replay.extend(registry.iter().filter(|r| r.sent).map(|r| r.frame.clone()));
        }
        self.queue_prepend(replay, &mut actions);
        self.pump_queue(&mut actions);

        actions.push(Action::Emit(Notice::Connected { session_reused }));
        actions
    }

    fn handle_changed(&mut self, changed: ChangedMessage) -> Vec<Action> {
        if changed.is_vent() {
            if let Some(listener) = self.vents.get(&changed.id) {
                let event = changed.event.unwrap_or(Value::Null);
                return vec![Action::InvokeVent { listener, event }];
            }
            tracing::debug!(id = %changed.id, "vent event with no registered listener");
            return Vec::new();
        }

        let Some(collection) = changed.collection else {
            tracing::debug!(id = %changed.id, "changed frame without collection");
            return Vec::new();
        };

        let mut actions: Vec<Action> = self
            .store
            .apply_changed(&collection, &changed.id, changed.fields, changed.cleared)
            .into_iter()
            .map(Action::Notify)
            .collect();
        actions.push(Action::Emit(Notice::Changed { collection, id: changed.id }));
        actions
    }

    fn handle_ready(&mut self, remote_ids: &[String]) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut flipped: Vec<Dependency> = Vec::new();
        {
            let mut registry = self.subs.lock();
            for remote_id in remote_ids {
                let Some(record) = registry.by_remote(remote_id) else {
                    tracing::debug!(remote_id, "ready for unknown subscription");
                    continue;
                };
                if record.ready {
                    continue;
                }
                record.ready = true;
                flipped.push(record.ready_dep.clone());
                if let Some(callback) = record.callbacks.on_ready.take() {
                    actions.push(Action::InvokeReady { callback });
                }
            }
        }
        // Dependency invalidation runs reuse hooks; never under the
        // registry lock.
        for dep in flipped {
            dep.changed();
        }
        actions
    }

    fn handle_nosub(&mut self, remote_id: &str, error: Option<Value>) -> Vec<Action> {
        let record = {
            let mut registry = self.subs.lock();
            if registry.consume_self_initiated(remote_id) {
                return Vec::new();
            }
            registry.remove_remote(remote_id)
        };
        let Some(mut record) = record else {
            tracing::debug!(remote_id, "nosub for unknown subscription");
            return Vec::new();
        };

        let error = error.map(|value| DdpError::from_value(&value));
        let mut actions = Vec::new();
        if let Some(err) = error.clone()
            && let Some(callback) = record.callbacks.on_error.take()
        {
            actions.push(Action::InvokeSubError { callback, error: err });
        }
        if let Some(callback) = record.callbacks.on_stop.take() {
            actions.push(Action::InvokeSubStop { callback, error });
        }
        if record.ready {
            record.ready_dep.changed();
        }
        actions
    }

    fn handle_result(
        &mut self,
        id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Vec<Action> {
        let Some(pending) = self.calls.take(id) else {
            tracing::debug!(id, "result for unknown method");
            return Vec::new();
        };

        match pending.kind {
            MethodKind::Plain => {
                let outcome = match error {
                    Some(value) => Err(DdpError::from_value(&value)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                match pending.callback {
                    Some(callback) => vec![Action::InvokeResult { callback, result: outcome }],
                    None => Vec::new(),
                }
            },
            MethodKind::Login { resume_token } => {
                self.handle_login_result(resume_token, result, error, pending.callback)
            },
            MethodKind::Logout => self.handle_logout_result(error, pending.callback),
            MethodKind::LogoutOthers => self.handle_logout_others_result(result, error, pending.callback),
        }
    }

    // ----- subscriptions -------------------------------------------------

    /// Start (or reuse) a subscription. Returns the stable local id.
    pub fn subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubCallbacks,
    ) -> (String, Vec<Action>) {
        let mut actions = Vec::new();

        // Inactive-reuse: a rerunning computation asking for the same
        // (name, params) takes over the existing server subscription.
        let reused = {
            let mut registry = self.subs.lock();
            registry.reusable(name, &params).map(|record| record.local_id.clone())
        };
        if let Some(local_id) = reused {
            let mut registry = self.subs.lock();
            if let Some(record) = registry.by_local(&local_id) {
                record.inactive = false;
                record.callbacks = callbacks;
                if record.ready
                    && let Some(callback) = record.callbacks.on_ready.take()
                {
                    actions.push(Action::InvokeReady { callback });
                }
            }
            drop(registry);
            self.arm_reuse_guard(&local_id);
            return (local_id, actions);
        }

        let id = self.env.random_id();
        let frame = ClientMessage::Sub {
            id: id.clone(),
            name: name.to_string(),
            params: params.clone(),
        }
        .stringify();

        self.subs.lock().insert(SubRecord {
            local_id: id.clone(),
            remote_id: id.clone(),
            name: name.to_string(),
            params,
            frame: frame.clone(),
            sent: false,
            inactive: false,
            ready: false,
            ready_dep: Dependency::new(&self.tracker),
            callbacks,
        });

        self.queue_push(frame, &mut actions);
        self.arm_reuse_guard(&id);
        (id, actions)
    }

    /// Reactive readiness accessor for a handle.
    pub fn sub_ready(&self, local_id: &str) -> bool {
        let state = {
            let mut registry = self.subs.lock();
            registry.by_local(local_id).map(|record| (record.ready_dep.clone(), record.ready))
        };
        match state {
            Some((dep, ready)) => {
                dep.depend();
                ready
            },
            None => false,
        }
    }

    /// Stop a subscription: send `unsub`, swallow the echo, tear down
    /// locally and fire `on_stop`.
    pub fn stop_sub(&mut self, local_id: &str) -> Vec<Action> {
        let record = self.subs.lock().remove_local(local_id);
        let Some(mut record) = record else {
            return Vec::new();
        };
        self.subs.lock().mark_self_initiated(record.remote_id.clone());
        self.vents.unregister(local_id);

        let mut actions = Vec::new();
        let frame = ClientMessage::Unsub { id: record.remote_id.clone() }.stringify();
        self.queue_push(frame, &mut actions);

        if record.ready {
            record.ready_dep.changed();
        }
        if let Some(callback) = record.callbacks.on_stop.take() {
            actions.push(Action::InvokeSubStop { callback, error: None });
        }
        actions
    }

    /// Stop every subscription condemned by the after-flush check.
    pub fn drain_pending_stops(&mut self) -> Vec<Action> {
        let condemned: Vec<String> = std::mem::take(&mut *self.pending_stops.lock());
        let mut actions = Vec::new();
        for local_id in condemned {
            actions.extend(self.stop_sub(&local_id));
        }
        actions
    }

    /// When subscribing inside a computation: a rerun first marks the
    /// record inactive, and whatever is still inactive after the flush
    /// (no rerun re-claimed it) gets stopped for real.
    fn arm_reuse_guard(&self, local_id: &str) {
        let Some(comp) = self.tracker.current() else {
            return;
        };
        let subs = Arc::clone(&self.subs);
        let pending = Arc::clone(&self.pending_stops);
        let tracker = self.tracker.clone();
        let local_id = local_id.to_string();
        self.tracker.on_invalidate(comp, move || {
            if let Some(record) = subs.lock().by_local(&local_id) {
                record.inactive = true;
            }
            let subs = Arc::clone(&subs);
            let pending = Arc::clone(&pending);
            tracker.after_flush(move || {
                let still_inactive =
                    subs.lock().by_local(&local_id).is_some_and(|record| record.inactive);
                if still_inactive {
                    pending.lock().push(local_id);
                }
            });
        });
    }

    // ----- methods -------------------------------------------------------

    /// Invoke a remote method. Returns the method id.
    pub fn call(
        &mut self,
        method: &str,
        params: Vec<Value>,
        callback: Option<ResultCallback>,
    ) -> (String, Vec<Action>) {
        self.call_with_kind(method, params, MethodKind::Plain, callback)
    }

    fn call_with_kind(
        &mut self,
        method: &str,
        params: Vec<Value>,
        kind: MethodKind,
        callback: Option<ResultCallback>,
    ) -> (String, Vec<Action>) {
        let id = self.env.random_id();
        let frame =
            ClientMessage::Method { id: id.clone(), method: method.to_string(), params }
                .stringify();
        self.calls.register(PendingMethod {
            id: id.clone(),
            frame: frame.clone(),
            sent: false,
            kind,
            callback,
        });

        let mut actions = Vec::new();
        self.queue_push(frame, &mut actions);
        (id, actions)
    }

    // ----- auth ----------------------------------------------------------

    /// Password login.
    pub fn login_with_password(
        &mut self,
        selector: UserSelector,
        password: &str,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        let mut user = Map::new();
        user.insert("user".to_string(), selector.to_value());
        user.insert("password".to_string(), password_digest(password));
        self.start_login(Value::Object(user), MethodKind::Login { resume_token: None }, callback)
    }

    /// Password login with a TOTP code.
    pub fn login_with_password_and_2fa_code(
        &mut self,
        selector: UserSelector,
        password: &str,
        code: &str,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        let mut user = Map::new();
        user.insert("user".to_string(), selector.to_value());
        user.insert("password".to_string(), password_digest(password));
        user.insert("code".to_string(), Value::from(code));
        self.start_login(Value::Object(user), MethodKind::Login { resume_token: None }, callback)
    }

    /// Resume a session from a persisted token. Guarded against
    /// concurrent resumes; a blank token just marks us logged out.
    pub fn login_with_token(&mut self, token: Option<String>) -> Vec<Action> {
        if self.auth.is_calling_login {
            return Vec::new();
        }
        let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
            self.dict.set(DICT_LOGGING_IN, Value::Bool(false));
            return Vec::new();
        };

        self.auth.is_calling_login = true;
        let mut params = Map::new();
        params.insert("resume".to_string(), Value::from(token.clone()));
        self.start_login(
            Value::Object(params),
            MethodKind::Login { resume_token: Some(token) },
            None,
        )
    }

    fn start_login(
        &mut self,
        params: Value,
        kind: MethodKind,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        self.dict.set(DICT_LOGGING_IN, Value::Bool(true));
        let (_, actions) = self.call_with_kind("login", vec![params], kind, callback);
        actions
    }

    fn handle_login_result(
        &mut self,
        resume_token: Option<String>,
        result: Option<Value>,
        error: Option<Value>,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        self.auth.is_calling_login = false;
        self.dict.set(DICT_LOGGING_IN, Value::Bool(false));

        let Some(error_value) = error else {
            let result = result.unwrap_or(Value::Null);
            let token = result.get("token").and_then(Value::as_str).map(str::to_string);
            if token.is_none() && resume_token.is_some() {
                // A resume that "succeeds" without a token is a
                // rejection in disguise.
                let mut err = DdpError {
                    reason: Some("login response carried no token".to_string()),
                    token: resume_token,
                    ..DdpError::default()
                };
                err.user_id = self.auth.user_id.clone();
                return self.resume_rejected(err, callback);
            }
            return self.login_succeeded(&result, token, callback);
        };

        let mut err = DdpError::from_value(&error_value);
        err.token = resume_token.clone();
        err.user_id = self.auth.user_id.clone();

        let Some(token) = resume_token else {
            // Password login: surface and stop, the user retries.
            let mut actions = vec![Action::Emit(Notice::LoginFailure(err.clone()))];
            if let Some(callback) = callback {
                actions.push(Action::InvokeResult { callback, result: Err(err) });
            }
            return actions;
        };

        match classify(&err) {
            LoginFailureClass::RateLimited(delay) => {
                self.auth.reload_at = Some(self.env.now() + delay);
                vec![Action::Emit(Notice::LoginFailure(err))]
            },
            LoginFailureClass::ResumeRejected => self.resume_rejected(err, callback),
            LoginFailureClass::Retryable => {
                let delay = self.auth.bump_retry();
                self.auth.retry_at = Some((self.env.now() + delay, token));
                vec![Action::Emit(Notice::LoginFailure(err))]
            },
        }
    }

    fn login_succeeded(
        &mut self,
        result: &Value,
        token: Option<String>,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        let user_id = result.get("id").and_then(Value::as_str).map(str::to_string);
        let expires = result.get("tokenExpires").and_then(ejson::normalize_expiry);

        write_key(self.storage.as_ref(), TOKEN_KEY, token.as_deref());
        write_key(self.storage.as_ref(), TOKEN_EXPIRES_KEY, expires.as_deref());
        write_key(self.storage.as_ref(), USER_ID_KEY, user_id.as_deref());

        if token.is_some() {
            self.auth.token = token;
        }
        self.auth.token_expires = expires.clone();
        self.auth.user_id = user_id.clone();
        self.dict
            .set(DICT_USER_ID, user_id.clone().map_or(Value::Null, Value::from));
        self.dict.set(DICT_TOKEN_EXPIRES, expires.map_or(Value::Null, Value::from));

        let mut actions =
            vec![Action::Emit(Notice::Login { user_id: user_id.unwrap_or_default() })];
        if let Some(callback) = callback {
            actions.push(Action::InvokeResult { callback, result: Ok(result.clone()) });
        }
        actions
    }

    /// Dead-token path: clear persisted and in-memory auth, disarm
    /// retries, surface the failure as a triggered logout.
    fn resume_rejected(
        &mut self,
        mut err: DdpError,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        err.is_logout_triggered = true;
        self.clear_persisted_auth();
        self.auth.clear_session();
        self.auth.retry_at = None;
        self.auth.reload_at = None;
        self.dict.set(DICT_USER_ID, Value::Null);
        self.dict.set(DICT_TOKEN_EXPIRES, Value::Null);

        let mut actions = vec![Action::Emit(Notice::LoginFailure(err.clone()))];
        if let Some(callback) = callback {
            actions.push(Action::InvokeResult { callback, result: Err(err) });
        }
        actions
    }

    /// Log out. Completes immediately when there is no session to end.
    pub fn logout(&mut self, callback: Option<ResultCallback>) -> Vec<Action> {
        if self.auth.user_id.is_none() && self.auth.token.is_none() {
            let mut actions = vec![Action::Emit(Notice::Logout)];
            if let Some(callback) = callback {
                actions.push(Action::InvokeResult { callback, result: Ok(Value::Null) });
            }
            return actions;
        }
        self.dict.set(DICT_LOGGING_OUT, Value::Bool(true));
        let (_, actions) = self.call_with_kind("logout", Vec::new(), MethodKind::Logout, callback);
        actions
    }

    fn handle_logout_result(
        &mut self,
        error: Option<Value>,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        self.dict.set(DICT_LOGGING_OUT, Value::Bool(false));
        self.clear_persisted_auth();
        self.auth.clear_session();
        self.dict.set(DICT_USER_ID, Value::Null);
        self.dict.set(DICT_TOKEN_EXPIRES, Value::Null);

        let mut actions = vec![Action::Emit(Notice::Logout)];
        if let Some(callback) = callback {
            let result = match error {
                Some(value) => Err(DdpError::from_value(&value)),
                None => Ok(Value::Null),
            };
            actions.push(Action::InvokeResult { callback, result });
        }
        actions
    }

    /// Invalidate every other session of this account. On success the
    /// server hands back a replacement token, which is persisted.
    pub fn logout_other_clients(&mut self, callback: Option<ResultCallback>) -> Vec<Action> {
        let (_, actions) = self.call_with_kind(
            "logoutOtherClients",
            Vec::new(),
            MethodKind::LogoutOthers,
            callback,
        );
        actions
    }

    fn handle_logout_others_result(
        &mut self,
        result: Option<Value>,
        error: Option<Value>,
        callback: Option<ResultCallback>,
    ) -> Vec<Action> {
        if let Some(value) = error {
            let err = DdpError::from_value(&value);
            return match callback {
                Some(callback) => vec![Action::InvokeResult { callback, result: Err(err) }],
                None => Vec::new(),
            };
        }

        let result = result.unwrap_or(Value::Null);
        if let Some(token) = result.get("token").and_then(Value::as_str) {
            let expires = result.get("tokenExpires").and_then(ejson::normalize_expiry);
            write_key(self.storage.as_ref(), TOKEN_KEY, Some(token));
            write_key(self.storage.as_ref(), TOKEN_EXPIRES_KEY, expires.as_deref());
            self.auth.token = Some(token.to_string());
            self.auth.token_expires = expires.clone();
            self.dict.set(DICT_TOKEN_EXPIRES, expires.map_or(Value::Null, Value::from));
        }
        match callback {
            Some(callback) => vec![Action::InvokeResult { callback, result: Ok(result) }],
            None => Vec::new(),
        }
    }

    /// Seed auth state from storage and (unless `skip_login`) resume.
    /// Resets the retry delay so a fresh app start is not stuck behind
    /// an old backoff.
    pub fn load_initial_user(&mut self, skip_login: bool) -> Vec<Action> {
        self.auth.retry_timeout = crate::auth::RELOAD_RETRY_TIMEOUT;

        let token = read_key(self.storage.as_ref(), TOKEN_KEY);
        let expires = read_key(self.storage.as_ref(), TOKEN_EXPIRES_KEY);
        let user_id = read_key(self.storage.as_ref(), USER_ID_KEY);

        self.auth.token = token.clone();
        self.auth.token_expires = expires.clone();
        self.auth.user_id = user_id.clone();
        self.dict.set(DICT_USER_ID, user_id.map_or(Value::Null, Value::from));
        self.dict.set(DICT_TOKEN_EXPIRES, expires.map_or(Value::Null, Value::from));

        if skip_login {
            self.dict.set(DICT_LOGGING_IN, Value::Bool(false));
            return Vec::new();
        }
        self.login_with_token(token)
    }

    fn clear_persisted_auth(&mut self) {
        write_key(self.storage.as_ref(), TOKEN_KEY, None);
        write_key(self.storage.as_ref(), TOKEN_EXPIRES_KEY, None);
        write_key(self.storage.as_ref(), USER_ID_KEY, None);
    }

    /// The in-memory auth token, if logged in.
    #[must_use]
    pub fn auth_token(&self) -> Option<String> {
        self.auth.token.clone()
    }

    /// Reactive user id.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.dict.get_str(DICT_USER_ID)
    }

    /// Reactive login-in-progress flag.
    #[must_use]
    pub fn logging_in(&self) -> bool {
        self.dict.get(DICT_LOGGING_IN).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Reactive logout-in-progress flag.
    #[must_use]
    pub fn logging_out(&self) -> bool {
        self.dict.get(DICT_LOGGING_OUT).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    // ----- timers --------------------------------------------------------

    /// Fire due deadlines: reconnect, login retry, rate-limit reload.
    pub fn tick(&mut self, now: E::Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if let Some(at) = self.reconnect_at
            && now >= at
        {
            self.reconnect_at = None;
            if self.want_connected && self.auto_reconnect && self.status == Status::Disconnected {
                actions.push(Action::OpenSocket);
            }
        }

        if let Some((at, token)) = self.auth.retry_at.clone()
            && now >= at
        {
            self.auth.retry_at = None;
            actions.extend(self.login_with_token(Some(token)));
        }

        if let Some(at) = self.auth.reload_at
            && now >= at
        {
            self.auth.reload_at = None;
            actions.extend(self.load_initial_user(false));
        }

        actions
    }

    // ----- queue ---------------------------------------------------------

    fn queue_push(&mut self, frame: String, actions: &mut Vec<Action>) {
        let connected = self.status == Status::Connected;
        let mut sent = Vec::new();
        self.queue.push(frame, |head| {
            if connected {
                sent.push(head.clone());
                true
            } else {
                false
            }
        });
        self.emit_sent(sent, actions);
    }

    fn queue_prepend(&mut self, frames: Vec<String>, actions: &mut Vec<Action>) {
        let connected = self.status == Status::Connected;
        let mut sent = Vec::new();
        self.queue.prepend(frames, |head| {
            if connected {
                sent.push(head.clone());
                true
            } else {
                false
            }
        });
        self.emit_sent(sent, actions);
    }

    fn pump_queue(&mut self, actions: &mut Vec<Action>) {
        let connected = self.status == Status::Connected;
        let mut sent = Vec::new();
        self.queue.process(|head| {
            if connected {
                sent.push(head.clone());
                true
            } else {
                false
            }
        });
        self.emit_sent(sent, actions);
    }

    fn emit_sent(&mut self, sent: Vec<String>, actions: &mut Vec<Action>) {
        if sent.is_empty() {
            return;
        }
        self.calls.mark_sent(&sent);
        self.subs.lock().mark_sent(&sent);
        for frame in sent {
            self.log_frame("out", &frame);
            actions.push(Action::Send(frame));
        }
    }

    /// Number of frames stuck behind the disconnect.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    // ----- logging -------------------------------------------------------

    fn log_frame(&self, direction: &str, frame: &str) {
        if !self.config.verbose {
            return;
        }
        tracing::debug!(direction, frame = %self.scrub(frame));
    }

    /// Privacy scrub: keep structure and field names, drop values of
    /// `params`, `fields`, and `result`.
    fn scrub(&self, frame: &str) -> String {
        if !self.config.private {
            return frame.to_string();
        }
        match serde_json::from_str::<Value>(frame) {
            Ok(Value::Object(mut map)) => {
                for key in ["params", "fields", "result"] {
                    if let Some(value) = map.get_mut(key) {
                        scrub_value(value);
                    }
                }
                Value::Object(map).to_string()
            },
            _ => frame.to_string(),
        }
    }
}

fn scrub_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for entry in map.values_mut() {
                *entry = Value::Null;
            }
        },
        Value::Array(items) => {
            for item in items.iter_mut() {
                *item = Value::Null;
            }
        },
        other => *other = Value::Null,
    }
}
