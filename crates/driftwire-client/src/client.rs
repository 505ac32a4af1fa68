//! Public client façade.
//!
//! [`Client`] owns the sans-IO session behind a lock and is the one
//! place actions get executed: wire commands go to the outbox for the
//! transport driver, notices go to listeners, and user callbacks run
//! with no lock held. Clones share state, so handles can live anywhere
//! in the application.

use std::collections::VecDeque;
use std::sync::Arc;

use driftwire_core::{
    Collection, CollectionStore, Computation, Environment, ReactiveDict, SystemEnv, Tracker, guard,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::auth::UserSelector;
use crate::config::ClientConfig;
use crate::conn::DdpConn;
use crate::error::{ClientError, DdpError};
use crate::event::{Action, Notice, SocketEvent};
use crate::storage::KeyStorage;
use crate::subscription::SubCallbacks;

/// Wire-level work for the transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Open the WebSocket.
    Open,
    /// Close the WebSocket.
    Close,
    /// Write a text frame.
    Send(String),
}

/// Network reachability seam.
///
/// Implementations call the watcher with `true`/`false` as the network
/// comes and goes; the client requests a reconnect on recovery when
/// auto-reconnect is armed.
pub trait Connectivity {
    /// Receive the configured probe URL before watching starts.
    fn configure(&self, _reachability_url: Option<&str>) {}

    /// Register the reachability watcher.
    fn watch(&self, callback: Box<dyn Fn(bool) + Send + Sync>);
}

/// Connection status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    /// Whether the session is established.
    pub connected: bool,
    /// `"disconnected"`, `"connecting"`, or `"connected"`.
    pub status: &'static str,
}

struct ClientInner<E: Environment> {
    env: E,
    tracker: Tracker,
    store: CollectionStore,
    dict: ReactiveDict,
    conn: Mutex<DdpConn<E>>,
    listeners: Mutex<Vec<Box<dyn FnMut(&Notice) + Send>>>,
    outbox: Mutex<VecDeque<WireCommand>>,
    wake: Arc<tokio::sync::Notify>,
}

/// The DDP client. Cheap to clone; clones share the session.
pub struct Client<E: Environment = SystemEnv> {
    inner: Arc<ClientInner<E>>,
}

impl<E: Environment> Clone for Client<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Client<SystemEnv> {
    /// Build a client against `config` with the system environment.
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn KeyStorage>,
    ) -> Result<Self, ClientError> {
        Self::with_env(SystemEnv, config, storage)
    }
}

impl<E: Environment> Client<E> {
    /// Build a client with an explicit environment (tests use a mock
    /// clock here).
    pub fn with_env(
        env: E,
        config: ClientConfig,
        storage: Arc<dyn KeyStorage>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let conn = DdpConn::new(env.clone(), config, storage);
        let wake = Arc::new(tokio::sync::Notify::new());
        let tracker = conn.tracker();
        {
            // Invalidations wake the driver, which flushes on its next
            // pass.
            let wake = Arc::clone(&wake);
            tracker.set_flush_notifier(move || wake.notify_waiters());
        }
        let inner = ClientInner {
            env,
            tracker,
            store: conn.store(),
            dict: conn.dict(),
            conn: Mutex::new(conn),
            listeners: Mutex::new(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            wake,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    // ----- lifecycle -----------------------------------------------------

    /// Open the connection (arms auto-reconnect per configuration).
    pub fn connect(&self) {
        let actions = self.inner.conn.lock().connect();
        self.process(actions);
    }

    /// Close the connection and disarm reconnection until
    /// [`Client::reconnect`].
    pub fn disconnect(&self) {
        let actions = self.inner.conn.lock().disconnect();
        self.process(actions);
    }

    /// Re-arm and reconnect after an explicit disconnect.
    pub fn reconnect(&self) {
        let actions = self.inner.conn.lock().reconnect();
        self.process(actions);
    }

    /// Connection status snapshot.
    #[must_use]
    pub fn status(&self) -> StatusInfo {
        let (connected, status) = self.inner.conn.lock().status();
        StatusInfo { connected, status }
    }

    /// Wire reachability notifications into the session: a recovered
    /// network requests an immediate reconnect.
    pub fn bind_connectivity(&self, connectivity: &impl Connectivity) {
        let reachability_url = self.config_snapshot().reachability_url;
        connectivity.configure(reachability_url.as_deref());
        let client = self.clone();
        connectivity.watch(Box::new(move |reachable| {
            if reachable {
                let actions = client.inner.conn.lock().network_recovered();
                client.process(actions);
            }
        }));
    }

    // ----- data ----------------------------------------------------------

    /// Handle to a named collection.
    pub fn collection(&self, name: &str) -> Result<Collection, ClientError> {
        Ok(self.inner.store.collection(name)?)
    }

    /// Handle to a named local collection (survives reconnects, ignored
    /// by server frames).
    pub fn local_collection(&self, name: &str) -> Result<Collection, ClientError> {
        Ok(self.inner.store.local_collection(name)?)
    }

    /// The shared document store.
    #[must_use]
    pub fn store(&self) -> CollectionStore {
        self.inner.store.clone()
    }

    /// The shared reactive graph.
    #[must_use]
    pub fn tracker(&self) -> Tracker {
        self.inner.tracker.clone()
    }

    /// The shared reactive dictionary.
    #[must_use]
    pub fn dict(&self) -> ReactiveDict {
        self.inner.dict.clone()
    }

    /// Run `func` as a computation that reruns when its data sources
    /// change. Stop it via the returned handle.
    pub fn autorun(&self, func: impl FnMut() + Send + 'static) -> Computation {
        let comp = self.inner.tracker.autorun(func);
        self.drive_silent();
        comp
    }

    /// Recompute `compute` whenever its inputs change and hand each
    /// value to `on_value`. The watch stops when the handle drops.
    pub fn watch<T: Send + 'static>(
        &self,
        mut compute: impl FnMut() -> T + Send + 'static,
        mut on_value: impl FnMut(T) + Send + 'static,
    ) -> WatchHandle {
        let comp = self.autorun(move || {
            let value = compute();
            on_value(value);
        });
        WatchHandle { comp }
    }

    // ----- methods and subscriptions -------------------------------------

    /// Invoke a remote method, discarding the result.
    pub fn call(&self, method: &str, params: Vec<Value>) {
        let actions = self.inner.conn.lock().call(method, params, None).1;
        self.process(actions);
    }

    /// Invoke a remote method; `callback` receives the result or the
    /// normalized error exactly once.
    pub fn call_with(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: impl FnOnce(Result<Value, DdpError>) + Send + 'static,
    ) {
        let actions =
            self.inner.conn.lock().call(method, params, Some(Box::new(callback))).1;
        self.process(actions);
    }

    /// Subscribe to a publication.
    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> SubscriptionHandle<E> {
        self.subscribe_with(name, params, SubCallbacks::new())
    }

    /// Subscribe with lifecycle callbacks.
    pub fn subscribe_with(
        &self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubCallbacks,
    ) -> SubscriptionHandle<E> {
        let (local_id, actions) = self.inner.conn.lock().subscribe(name, params, callbacks);
        self.process(actions);
        SubscriptionHandle { client: self.clone(), local_id }
    }

    // ----- auth ----------------------------------------------------------

    /// Log in with username/email and password.
    pub fn login_with_password(
        &self,
        user: impl Into<UserSelector>,
        password: &str,
        callback: impl FnOnce(Result<Value, DdpError>) + Send + 'static,
    ) {
        let actions = self.inner.conn.lock().login_with_password(
            user.into(),
            password,
            Some(Box::new(callback)),
        );
        self.process(actions);
    }

    /// Log in with username/email, password, and a TOTP code.
    pub fn login_with_password_and_2fa_code(
        &self,
        user: impl Into<UserSelector>,
        password: &str,
        code: &str,
        callback: impl FnOnce(Result<Value, DdpError>) + Send + 'static,
    ) {
        let actions = self.inner.conn.lock().login_with_password_and_2fa_code(
            user.into(),
            password,
            code,
            Some(Box::new(callback)),
        );
        self.process(actions);
    }

    /// Resume a session from an explicit token.
    pub fn login_with_token(&self, token: Option<String>) {
        let actions = self.inner.conn.lock().login_with_token(token);
        self.process(actions);
    }

    /// Seed auth state from key storage and resume the persisted
    /// session, if any.
    pub fn load_initial_user(&self) {
        let actions = self.inner.conn.lock().load_initial_user(false);
        self.process(actions);
    }

    /// Seed auth state from key storage without attempting a resume,
    /// so `user_id()` reads correctly before any login runs.
    pub fn load_initial_user_without_resume(&self) {
        let actions = self.inner.conn.lock().load_initial_user(true);
        self.process(actions);
    }

    /// Log out.
    pub fn logout(&self, callback: impl FnOnce(Result<Value, DdpError>) + Send + 'static) {
        let actions = self.inner.conn.lock().logout(Some(Box::new(callback)));
        self.process(actions);
    }

    /// Invalidate this account's other sessions.
    pub fn logout_other_clients(
        &self,
        callback: impl FnOnce(Result<Value, DdpError>) + Send + 'static,
    ) {
        let actions = self.inner.conn.lock().logout_other_clients(Some(Box::new(callback)));
        self.process(actions);
    }

    /// Reactive user id of the logged-in user.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.inner.conn.lock().user_id()
    }

    /// The logged-in user's document from the `users` collection.
    #[must_use]
    pub fn user(&self) -> Option<driftwire_core::Document> {
        let user_id = self.user_id()?;
        self.inner.store.find_one("users", Some(serde_json::json!({"_id": user_id})))
    }

    /// Reactive login-in-progress flag.
    #[must_use]
    pub fn logging_in(&self) -> bool {
        self.inner.conn.lock().logging_in()
    }

    /// Reactive logout-in-progress flag.
    #[must_use]
    pub fn logging_out(&self) -> bool {
        self.inner.conn.lock().logging_out()
    }

    /// The current auth token, if logged in.
    #[must_use]
    pub fn get_auth_token(&self) -> Option<String> {
        self.inner.conn.lock().auth_token()
    }

    // ----- vent ----------------------------------------------------------

    /// Subscribe to a vent stream. Attach the handler with
    /// [`VentHandle::listen`].
    pub fn vent_subscribe(&self, name: &str, args: Vec<Value>) -> VentHandle<E> {
        let vent_id = self.inner.env.random_id();
        let mut params = vec![Value::from(vent_id.clone())];
        params.extend(args);
        let sub = self.subscribe(name, params);
        VentHandle { vent_id, sub }
    }

    /// Drop every vent listener.
    pub fn vent_reset(&self) {
        self.inner.conn.lock().vents().reset();
    }

    // ----- events and driving --------------------------------------------

    /// Register a notice listener.
    pub fn on_notice(&self, listener: impl FnMut(&Notice) + Send + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// Feed a transport event (the WebSocket driver calls this).
    pub fn handle_socket_event(&self, event: SocketEvent) {
        let actions = self.inner.conn.lock().handle_socket_event(event);
        self.process(actions);
    }

    /// Fire due timers (reconnect, login retries).
    pub fn tick(&self) {
        let now = self.inner.env.now();
        let actions = self.inner.conn.lock().tick(now);
        self.process(actions);
    }

    /// Settle the reactive graph and collect wire commands for the
    /// transport driver.
    pub fn drive(&self) -> Vec<WireCommand> {
        self.drive_silent();
        self.inner.outbox.lock().drain(..).collect()
    }

    fn drive_silent(&self) {
        self.inner.tracker.flush();
        let actions = self.inner.conn.lock().drain_pending_stops();
        self.process(actions);
        self.inner.tracker.flush();
    }

    /// Wake handle for the transport runtime.
    pub(crate) fn wake(&self) -> Arc<tokio::sync::Notify> {
        Arc::clone(&self.inner.wake)
    }

    pub(crate) fn env(&self) -> &E {
        &self.inner.env
    }

    pub(crate) fn config_snapshot(&self) -> ClientConfig {
        self.inner.conn.lock().config().clone()
    }

    /// Execute actions: wire commands to the outbox, everything
    /// user-visible invoked here with no lock held.
    fn process(&self, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }
        for action in actions {
            match action {
                Action::OpenSocket => self.inner.outbox.lock().push_back(WireCommand::Open),
                Action::CloseSocket => self.inner.outbox.lock().push_back(WireCommand::Close),
                Action::Send(frame) => {
                    self.inner.outbox.lock().push_back(WireCommand::Send(frame));
                },
                Action::Emit(notice) => self.emit(&notice),
                Action::Notify(dispatch) => dispatch.run(),
                Action::InvokeResult { callback, result } => {
                    guard::protect("method.callback", move || callback(result));
                },
                Action::InvokeReady { callback } => {
                    guard::protect("subscription.on_ready", callback);
                },
                Action::InvokeSubError { callback, error } => {
                    guard::protect("subscription.on_error", move || callback(error));
                },
                Action::InvokeSubStop { callback, error } => {
                    guard::protect("subscription.on_stop", move || callback(error));
                },
                Action::InvokeVent { listener, event } => {
                    guard::protect("vent.listener", move || (listener.lock())(event));
                },
            }
        }
        self.inner.wake.notify_waiters();
    }

    /// Deliver a notice to every listener, tolerating listeners that
    /// register more listeners from inside the callback.
    fn emit(&self, notice: &Notice) {
        let mut current = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in &mut current {
            guard::protect("notice.listener", || listener(notice));
        }
        let mut slot = self.inner.listeners.lock();
        let registered_during = std::mem::take(&mut *slot);
        *slot = current;
        slot.extend(registered_during);
    }
}

/// Handle to a live subscription.
pub struct SubscriptionHandle<E: Environment = SystemEnv> {
    client: Client<E>,
    local_id: String,
}

impl<E: Environment> SubscriptionHandle<E> {
    /// Stable subscription id.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.local_id
    }

    /// Whether the server marked this subscription ready. Reactive:
    /// calling it inside a computation subscribes to readiness flips.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.client.inner.conn.lock().sub_ready(&self.local_id)
    }

    /// Stop the subscription.
    pub fn stop(&self) {
        let actions = self.client.inner.conn.lock().stop_sub(&self.local_id);
        self.client.process(actions);
    }
}

/// Handle to a vent stream.
pub struct VentHandle<E: Environment = SystemEnv> {
    vent_id: String,
    sub: SubscriptionHandle<E>,
}

impl<E: Environment> VentHandle<E> {
    /// The vent stream id (first subscribe parameter on the wire).
    #[must_use]
    pub fn vent_id(&self) -> &str {
        &self.vent_id
    }

    /// Attach the event handler.
    pub fn listen(&self, handler: impl FnMut(Value) + Send + 'static) {
        self.sub.client.inner.conn.lock().vents().register(self.vent_id.clone(), handler);
    }

    /// Underlying subscription handle.
    #[must_use]
    pub fn subscription(&self) -> &SubscriptionHandle<E> {
        &self.sub
    }

    /// Stop listening and unsubscribe.
    pub fn stop(&self) {
        self.sub.client.inner.conn.lock().vents().unregister(&self.vent_id);
        self.sub.stop();
    }
}

/// Stops its computation when dropped. Returned by [`Client::watch`].
pub struct WatchHandle {
    comp: Computation,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.comp.stop();
    }
}
