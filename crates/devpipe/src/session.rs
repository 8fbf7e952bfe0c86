//! Session handles and their event streams.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::ROOT_SESSION;
use crate::connection::Connection;
use crate::error::{CdpError, DispatchError};

/// Something the remote end pushed to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Event { method: String, params: Value },
    /// Error message not tied to a request.
    UncaughtError(Value),
}

/// Events delivered to one session, in arrival order.
///
/// Consumers may stop and resume reading at any time while the connection is
/// open. The stream ends once the connection is torn down or the session is
/// detached.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Cloneable, send-only handle scoped to one session.
#[derive(Clone)]
pub struct SessionSender {
    session_id: Arc<str>,
    connection: Connection,
}

impl SessionSender {
    pub(crate) fn new(session_id: &str, connection: Connection) -> Self {
        Self {
            session_id: Arc::from(session_id),
            connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.connection.send(&self.session_id, method, params).await
    }

    pub async fn send_and_forget(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), DispatchError> {
        self.connection
            .send_and_forget(&self.session_id, method, params)
            .await
    }
}

/// A registered session: its sender plus its event stream.
pub struct Session {
    sender: SessionSender,
    events: EventStream,
}

impl Session {
    pub(crate) fn new(sender: SessionSender, events: EventStream) -> Self {
        Self { sender, events }
    }

    pub fn id(&self) -> &str {
        self.sender.id()
    }

    pub fn is_root(&self) -> bool {
        self.id() == ROOT_SESSION
    }

    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    pub fn events(&mut self) -> &mut EventStream {
        &mut self.events
    }

    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.sender.send(method, params).await
    }

    pub async fn send_and_forget(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), DispatchError> {
        self.sender.send_and_forget(method, params).await
    }

    /// Detach from the target and unregister the session.
    ///
    /// The detach command goes out on the root session. Its failure is
    /// ignored unless the connection itself is desynchronized.
    pub async fn detach(self) -> Result<(), DispatchError> {
        self.sender
            .connection
            .detach_session(self.sender.id())
            .await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.id())
            .finish_non_exhaustive()
    }
}
