//! Plugin-side stub for the Node Resource Interface (NRI).
//!
//! The stub connects to the container runtime, registers a plugin and turns
//! every runtime request into a [`LifecycleEvent`] handed to a single
//! [`Plugin::handle`] call. The plugin answers with a [`Reply`] which the stub
//! maps back onto the protocol response of that request.
//!
//! # Examples
//!
//! ```no_run
//! # use nri_stub::{LifecycleEvent, Plugin, Reply, HandlerError, Stub, StubConfig};
//! # use tokio_util::sync::CancellationToken;
//! struct Noop;
//!
//! impl Plugin for Noop {
//!     fn handle(&self, _event: LifecycleEvent) -> Result<Reply, HandlerError> {
//!         Ok(Reply::Ack)
//!     }
//! }
//!
//! # async fn run() -> nri_stub::StubResult<()> {
//! let stub = Stub::connect(StubConfig::new("noop")).await?;
//! stub.run(Noop, CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod stub;
pub mod transport;

pub use config::StubConfig;
pub use config::DEFAULT_SOCKET_PATH;
pub use error::StubError;
pub use error::StubResult;
pub use event::EventKind;
pub use event::HandlerError;
pub use event::LifecycleEvent;
pub use event::Plugin;
pub use event::Reply;
pub use stub::Stub;
