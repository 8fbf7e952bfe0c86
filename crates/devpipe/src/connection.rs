//! Protocol client: request ids, pending calls, session registry and the
//! dispatch loop routing every inbound message.
//!
//! Flow:
//! 1. `send` registers a pending entry under a fresh id, then writes the request
//! 2. The dispatch task classifies each inbound frame
//! 3. Responses resolve their pending entry; events and errors go to a session
//! 4. Anything that cannot be routed tears the connection down

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Inbound, ROOT_SESSION, RemoteError, Request};
use crate::bridge::transport::{PipeTransport, TransportEvent, TransportState};
use crate::error::{CdpError, DispatchError};
use crate::session::{EventStream, Session, SessionEvent, SessionSender};

struct PendingCall {
    method: String,
    resolver: oneshot::Sender<Result<Value, CdpError>>,
}

/// Pending table and session registry. Guarded by a single lock.
#[derive(Default)]
struct Registry {
    pending: HashMap<u64, PendingCall>,
    sessions: HashMap<String, mpsc::UnboundedSender<SessionEvent>>,
    closed: bool,
    fatal: Option<DispatchError>,
}

struct Inner {
    transport: PipeTransport,
    next_id: AtomicU64,
    registry: StdMutex<Registry>,
    torn_down: CancellationToken,
}

/// Handle to an open connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open a connection over a reader/writer pair and register the root session.
    pub async fn open<R, W>(reader: R, writer: W) -> io::Result<(Self, Session)>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (transport, mut events) = PipeTransport::open(reader, writer);

        let Some(TransportEvent::Open) = events.recv().await else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport closed before opening",
            ));
        };

        let connection = Self {
            inner: Arc::new(Inner {
                transport,
                next_id: AtomicU64::new(1),
                registry: StdMutex::new(Registry::default()),
                torn_down: CancellationToken::new(),
            }),
        };
        let root = connection
            .register(ROOT_SESSION.to_string())
            .map_err(io::Error::other)?;

        tokio::spawn(run_dispatch_loop(Arc::downgrade(&connection.inner), events));

        tracing::debug!("Connection open");
        Ok((connection, root))
    }

    /// Send a command and wait for its response.
    ///
    /// There is no timeout: wrap the call in `tokio::time::timeout` if the
    /// remote end might never answer.
    pub async fn send(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CdpError> {
        if self.inner.transport.state() != TransportState::Open {
            return Err(CdpError::closed(method));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            method,
            params: params.as_ref(),
            session_id,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| CdpError::Encode {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

        let (resolver, response) = oneshot::channel();
        {
            let mut registry = self.inner.lock();
            if registry.closed {
                return Err(CdpError::closed(method));
            }
            registry.pending.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    resolver,
                },
            );
        }

        let mut guard = PendingGuard {
            inner: &self.inner,
            id,
            armed: true,
        };

        tracing::trace!(id, method, session_id, "Sending request");
        let written = self
            .inner
            .transport
            .send_frame(Bytes::from(payload), || guard.armed = false)
            .await;
        if let Err(e) = written {
            tracing::warn!(id, method, error = %e, "Failed to write request");
            guard.armed = true;
            return Err(CdpError::closed(method));
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(CdpError::closed(method)),
        }
    }

    /// Like [`send`](Self::send), but a closed transport or an error response
    /// is not a failure. Desynchronization still is.
    pub async fn send_and_forget(
        &self,
        session_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), DispatchError> {
        match self.send(session_id, method, params).await {
            Ok(_) => Ok(()),
            Err(CdpError::Dispatch(e)) => Err(e),
            Err(e) => {
                tracing::debug!(session_id, method, error = %e, "Ignoring failed call");
                Ok(())
            }
        }
    }

    /// Register a session so its events can be routed.
    pub fn create_session(&self, session_id: impl Into<String>) -> Result<Session, CdpError> {
        self.register(session_id.into())
    }

    pub(crate) async fn detach_session(&self, session_id: &str) -> Result<(), DispatchError> {
        let result = self
            .send_and_forget(
                ROOT_SESSION,
                "Target.detachFromTarget",
                Some(json!({ "sessionId": session_id })),
            )
            .await;

        // The root session lives as long as the connection.
        if session_id != ROOT_SESSION {
            self.inner.lock().sessions.remove(session_id);
            tracing::debug!(session_id, "Session detached");
        }
        result
    }

    pub fn state(&self) -> TransportState {
        self.inner.transport.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.torn_down.is_cancelled()
    }

    /// Wait until the connection is torn down.
    ///
    /// Returns the dispatch error that caused it, or `None` when the remote
    /// end simply closed the pipe or [`close`](Self::close) was called.
    pub async fn closed(&self) -> Option<DispatchError> {
        self.inner.torn_down.cancelled().await;
        self.inner.lock().fatal.clone()
    }

    /// Close the transport locally. Pending calls fail with `TransportClosed`.
    pub async fn close(&self) {
        self.inner.transport.close().await;
        self.inner.torn_down.cancelled().await;
    }

    fn register(&self, session_id: String) -> Result<Session, CdpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut registry = self.inner.lock();
            if registry.sessions.contains_key(&session_id) {
                return Err(CdpError::SessionExists(session_id));
            }
            // After teardown the sink is dropped right away, ending the stream.
            if !registry.closed {
                registry.sessions.insert(session_id.clone(), tx);
            }
        }
        tracing::debug!(%session_id, "Session registered");
        Ok(Session::new(
            SessionSender::new(&session_id, self.clone()),
            EventStream::new(rx),
        ))
    }
}

/// Drops a pending entry whose request never reached the write buffer, so a
/// cancelled `send` leaves nothing behind. Once the frame is buffered the
/// response will arrive and the entry must stay to match it.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.lock().pending.remove(&self.id).is_some() {
            tracing::trace!(id = self.id, "Request abandoned before it was written");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("torn_down", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Connection registry mutex poisoned");
            PoisonError::into_inner(poisoned)
        })
    }

    fn dispatch(&self, text: &str) -> Result<(), DispatchError> {
        match Inbound::parse(text) {
            Inbound::Success { id, result } => self.resolve(id, Ok(result)),
            Inbound::Failure { id, error } => self.resolve(id, Err(error)),
            Inbound::GlobalError { session_id, error } => {
                self.deliver(session_id, None, SessionEvent::UncaughtError(error))
            }
            Inbound::Event {
                session_id,
                method,
                params,
            } => self.deliver(
                session_id,
                Some(method.clone()),
                SessionEvent::Event { method, params },
            ),
            Inbound::Malformed { reason } => Err(DispatchError::Malformed {
                reason,
                frame: text.to_string(),
            }),
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, RemoteError>) -> Result<(), DispatchError> {
        let call = self
            .lock()
            .pending
            .remove(&id)
            .ok_or(DispatchError::UnmatchedResponse { id })?;

        let result = outcome.map_err(|error| CdpError::Protocol {
            method: call.method.clone(),
            message: error.message,
            code: error.code,
        });

        if call.resolver.send(result).is_err() {
            tracing::debug!(id, method = %call.method, "Caller stopped waiting for response");
        }
        Ok(())
    }

    fn deliver(
        &self,
        session_id: String,
        method: Option<String>,
        event: SessionEvent,
    ) -> Result<(), DispatchError> {
        let registry = self.lock();
        let Some(sink) = registry.sessions.get(&session_id) else {
            return Err(DispatchError::UnknownSession { session_id, method });
        };

        if sink.send(event).is_err() {
            tracing::warn!(
                %session_id,
                method = method.as_deref().unwrap_or("error"),
                "Session handle dropped without detaching, discarding event"
            );
        }
        Ok(())
    }

    async fn tear_down(&self, fatal: Option<DispatchError>) {
        let (pending, sessions) = {
            let mut registry = self.lock();
            registry.closed = true;
            if registry.fatal.is_none() {
                registry.fatal = fatal.clone();
            }
            (
                std::mem::take(&mut registry.pending),
                std::mem::take(&mut registry.sessions),
            )
        };

        tracing::debug!(
            pending = pending.len(),
            sessions = sessions.len(),
            "Tearing down connection"
        );
        drop(sessions);

        for (id, call) in pending {
            let error = match &fatal {
                Some(e) => CdpError::Dispatch(e.clone()),
                None => CdpError::TransportClosed {
                    method: call.method,
                },
            };
            if call.resolver.send(Err(error)).is_err() {
                tracing::trace!(id, "Pending caller already gone at teardown");
            }
        }

        self.transport.close().await;
        self.torn_down.cancel();
    }
}

async fn run_dispatch_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    let fatal = loop {
        let Some(event) = events.recv().await else {
            tracing::debug!("Transport event stream ended");
            break None;
        };
        let Some(connection) = inner.upgrade() else {
            tracing::debug!("Connection dropped, dispatch loop exiting");
            return;
        };

        match event {
            TransportEvent::Message(text) => {
                tracing::trace!(frame = %text, "Received frame");
                if let Err(e) = connection.dispatch(&text) {
                    tracing::error!(error = %e, "Protocol desynchronized, tearing down connection");
                    break Some(e);
                }
            }
            TransportEvent::Undecodable(e) => {
                let e = DispatchError::Malformed {
                    reason: format!("frame is not valid UTF-8: {}", e.utf8_error()),
                    frame: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                };
                tracing::error!(error = %e, "Protocol desynchronized, tearing down connection");
                break Some(e);
            }
            TransportEvent::Closed => {
                tracing::info!("Remote end closed the pipe");
                break None;
            }
            TransportEvent::Open => {
                tracing::warn!("Unexpected Open on an open transport");
            }
        }
    };

    if let Some(connection) = inner.upgrade() {
        connection.tear_down(fatal).await;
    }
}
