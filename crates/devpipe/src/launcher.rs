//! Launch a browser and connect to its debugging pipes.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use serde_json::Value;

use crate::connection::Connection;
use crate::error::{CdpError, DispatchError, LaunchError};
use crate::process::{self, ChildProcess, SpawnedChild};
use crate::session::{EventStream, Session};

/// Stderr line prefix that announces the debugging endpoint.
pub const DEFAULT_ENDPOINT_PREFIX: &str = "DevTools listening on ";

/// How long a child gets between SIGINT and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    pub flags: Vec<String>,
    pub grace_period: Duration,
    pub endpoint_prefix: String,
}

impl LaunchConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            flags: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            endpoint_prefix: DEFAULT_ENDPOINT_PREFIX.to_string(),
        }
    }

    /// Replace the flag list. The remote-debugging flags are always appended.
    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_endpoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.endpoint_prefix = prefix.into();
        self
    }
}

/// Spawn `executable` with `flags` and connect to it.
pub async fn launch<I, S>(executable: impl Into<PathBuf>, flags: I) -> Result<Browser, LaunchError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    launch_with(LaunchConfig::new(executable).with_flags(flags)).await
}

pub async fn launch_with(config: LaunchConfig) -> Result<Browser, LaunchError> {
    let SpawnedChild {
        process,
        pipes,
        endpoint_url,
    } = process::spawn(&config).await?;

    // On failure `process` drops here and the child is killed.
    let (connection, root) = Connection::open(pipes.reader, pipes.writer)
        .await
        .map_err(LaunchError::Transport)?;

    tracing::info!(%endpoint_url, pid = ?process.pid(), "Browser connected");

    Ok(Browser {
        endpoint_url,
        process,
        connection,
        root,
        grace_period: config.grace_period,
    })
}

/// A running browser with an open connection on its root session.
///
/// Dropping it kills the child immediately; [`close`](Self::close) shuts it
/// down gracefully.
#[derive(Debug)]
pub struct Browser {
    endpoint_url: String,
    process: ChildProcess,
    connection: Connection,
    root: Session,
    grace_period: Duration,
}

impl Browser {
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn root(&self) -> &Session {
        &self.root
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Send on the root session.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        self.root.send(method, params).await
    }

    pub async fn send_and_forget(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), DispatchError> {
        self.root.send_and_forget(method, params).await
    }

    /// Root session events.
    pub fn events(&mut self) -> &mut EventStream {
        self.root.events()
    }

    pub fn create_session(&self, session_id: impl Into<String>) -> Result<Session, CdpError> {
        self.connection.create_session(session_id)
    }

    /// Wait for the connection to be torn down. See [`Connection::closed`].
    pub async fn closed(&self) -> Option<DispatchError> {
        self.connection.closed().await
    }

    /// Close the connection, then interrupt the child and wait for it.
    ///
    /// The child is always signalled, even when the connection does not
    /// finish closing within the grace period.
    pub async fn close(mut self) -> io::Result<ExitStatus> {
        if tokio::time::timeout(self.grace_period, self.connection.close())
            .await
            .is_err()
        {
            tracing::warn!(grace = ?self.grace_period, "Connection did not close in time");
        }
        let status = self.process.shutdown(self.grace_period).await?;
        tracing::info!(?status, "Browser exited");
        Ok(status)
    }
}
