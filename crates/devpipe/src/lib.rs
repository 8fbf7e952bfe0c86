//! devpipe: DevTools protocol client over a spawned browser's debugging pipes.
//!
//! A browser started with `--remote-debugging-pipe` reads NUL-terminated JSON
//! commands from fd 3 and writes responses and events to fd 4. [`launch`]
//! spawns it, waits for the endpoint announcement on stderr, and returns a
//! [`Browser`] whose [`Connection`] correlates responses to calls by id and
//! routes events to per-session streams.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut browser = devpipe::launch("/usr/bin/chromium", ["--headless"]).await?;
//! let version = browser.send("Browser.getVersion", None).await?;
//! println!("{version}");
//! while let Some(event) = browser.events().recv().await {
//!     println!("{event:?}");
//! }
//! browser.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
mod connection;
mod error;
mod session;

#[cfg(unix)]
mod launcher;
#[cfg(unix)]
pub mod process;

pub use bridge::transport::TransportState;
pub use connection::Connection;
pub use error::{CdpError, DispatchError, LaunchError};
pub use session::{EventStream, Session, SessionEvent, SessionSender};

#[cfg(unix)]
pub use launcher::{
    Browser, DEFAULT_ENDPOINT_PREFIX, DEFAULT_GRACE_PERIOD, LaunchConfig, launch, launch_with,
};
