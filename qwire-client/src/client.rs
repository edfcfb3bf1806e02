//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, Credentials, SessionState};
use crate::error::ClientError;
use crate::event::{Disconnect, Event};
use crate::stream::ClientStream;
use bytes::Bytes;
use qwire_protocol::{Frame, MsgPack, RequestKind};
use serde::de::DeserializeOwned;
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Scope used until [`Client::use_scope`] picks another one.
pub const DEFAULT_SCOPE: &str = "@t";

/// Normalizes a scope name: `stuff` and `:stuff` become `@:stuff`, anything
/// starting with `@` is kept as is.
pub fn normalize_scope(scope: &str) -> String {
    if scope.starts_with('@') {
        scope.to_string()
    } else if scope.starts_with(':') {
        format!("@{}", scope)
    } else {
        format!("@:{}", scope)
    }
}

/// `[scope, name?, args...]` as one flat array.
struct ScopedCall<'a, A> {
    scope: &'a str,
    name: Option<&'a str>,
    args: &'a [A],
}

impl<A: Serialize> Serialize for ScopedCall<'_, A> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 1 + usize::from(self.name.is_some()) + self.args.len();
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(self.scope)?;
        if let Some(name) = self.name {
            seq.serialize_element(name)?;
        }
        for arg in self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

/// Auto-authentication in flight. Dropped before `settle`, it closes the
/// connection so no unauthenticated session is left behind.
struct AuthAttempt {
    conn: Option<Arc<Connection>>,
}

impl AuthAttempt {
    fn settle(mut self) {
        self.conn = None;
    }
}

impl Drop for AuthAttempt {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!("authentication abandoned, closing connection");
            handle.spawn(async move {
                let _ = conn.close().await;
            });
        }
    }
}

/// High-level client.
pub struct Client {
    conn: Arc<Connection>,
    scope: parking_lot::Mutex<String>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            scope: parking_lot::Mutex::new(DEFAULT_SCOPE.to_string()),
        }
    }

    /// Connects, then authenticates if the configuration carries credentials.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let was_connected = self.conn.is_connected();
        self.conn.connect().await?;
        if !was_connected {
            self.auto_authenticate().await?;
        }
        Ok(())
    }

    /// Like [`Client::connect`], over an already opened stream.
    pub async fn connect_stream(&self, stream: ClientStream) -> Result<(), ClientError> {
        let was_connected = self.conn.is_connected();
        self.conn.connect_stream(stream).await?;
        if !was_connected {
            self.auto_authenticate().await?;
        }
        Ok(())
    }

    async fn auto_authenticate(&self) -> Result<(), ClientError> {
        let Some(credentials) = self.conn.config().auth.clone() else {
            return Ok(());
        };

        let attempt = AuthAttempt {
            conn: Some(self.conn.clone()),
        };
        let result = self.authenticate(&credentials).await;
        attempt.settle();

        if let Err(e) = result {
            tracing::warn!("Authentication with {} failed: {}", self.conn.endpoint(), e);
            self.conn.close().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.conn.state()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Describes where the client is connected, or `disconnected`.
    pub fn connection_info(&self) -> String {
        if self.conn.is_connected() {
            self.conn.endpoint().to_string()
        } else {
            "disconnected".to_string()
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.conn.subscribe_events()
    }

    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<Disconnect> {
        self.conn.subscribe_disconnects()
    }

    /// Waits until the connection goes away.
    pub async fn wait_closed(&self) -> Option<Disconnect> {
        self.conn.closed().await
    }

    // =========================================================================
    // Scope
    // =========================================================================

    /// Sets the default scope for queries, runs and watches.
    pub fn use_scope(&self, scope: &str) {
        *self.scope.lock() = normalize_scope(scope);
    }

    pub fn scope(&self) -> String {
        self.scope.lock().clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn request<T: Serialize + ?Sized>(
        &self,
        kind: RequestKind,
        value: &T,
    ) -> Result<Frame, ClientError> {
        let timeout = self.conn.config().request_timeout;
        self.conn.request(kind, value, timeout).await
    }

    fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, ClientError> {
        Ok(MsgPack::decode(frame.payload())?)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Pings the node.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let timeout = self.conn.config().request_timeout;
        self.conn
            .send(RequestKind::Ping, Bytes::new(), timeout)
            .await?;
        Ok(())
    }

    /// Authenticates the connection.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<(), ClientError> {
        self.request(RequestKind::Auth, credentials).await?;
        tracing::debug!("Authenticated with {}", self.conn.endpoint());
        Ok(())
    }

    /// Runs `code` in the default scope.
    pub async fn query<T: DeserializeOwned>(&self, code: &str) -> Result<T, ClientError> {
        let scope = self.scope();
        let frame = self.request(RequestKind::Query, &(scope, code)).await?;
        Self::decode(&frame)
    }

    /// Runs `code` in the default scope with variables.
    pub async fn query_with<T, V>(&self, code: &str, vars: &V) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        V: Serialize + ?Sized,
    {
        let scope = self.scope();
        self.query_in(&scope, code, Some(vars)).await
    }

    /// Runs `code` in an explicit scope.
    pub async fn query_in<T, V>(
        &self,
        scope: &str,
        code: &str,
        vars: Option<&V>,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        V: Serialize + ?Sized,
    {
        let scope = normalize_scope(scope);
        let frame = match vars {
            Some(vars) => {
                self.request(RequestKind::Query, &(scope, code, vars))
                    .await?
            }
            None => self.request(RequestKind::Query, &(scope, code)).await?,
        };
        Self::decode(&frame)
    }

    /// Calls a stored procedure in the default scope.
    pub async fn run<T, A>(&self, procedure: &str, args: &[A]) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        let scope = self.scope();
        self.run_in(&scope, procedure, args).await
    }

    /// Calls a stored procedure in an explicit scope.
    pub async fn run_in<T, A>(
        &self,
        scope: &str,
        procedure: &str,
        args: &[A],
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        A: Serialize,
    {
        let scope = normalize_scope(scope);
        let call = ScopedCall {
            scope: &scope,
            name: Some(procedure),
            args,
        };
        let frame = self.request(RequestKind::Run, &call).await?;
        Self::decode(&frame)
    }

    /// Starts receiving watch events for the given ids.
    ///
    /// Without ids this watches the scope itself (use scope `@n` for node
    /// status events).
    pub async fn watch(&self, scope: Option<&str>, ids: &[u64]) -> Result<(), ClientError> {
        self.watch_request(RequestKind::Watch, scope, ids).await
    }

    /// Stops receiving watch events for the given ids.
    pub async fn unwatch(&self, scope: Option<&str>, ids: &[u64]) -> Result<(), ClientError> {
        self.watch_request(RequestKind::Unwatch, scope, ids).await
    }

    async fn watch_request(
        &self,
        kind: RequestKind,
        scope: Option<&str>,
        ids: &[u64],
    ) -> Result<(), ClientError> {
        let scope = match scope {
            Some(scope) => normalize_scope(scope),
            None => self.scope(),
        };
        let call = ScopedCall {
            scope: &scope,
            name: None,
            args: ids,
        };
        self.request(kind, &call).await?;
        Ok(())
    }
}
