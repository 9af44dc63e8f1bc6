//! # uxec — unified command execution engine
//!
//! `uxec` lets a program describe shell-style commands abstractly and
//! dispatch them transparently to one of several backends: a local process,
//! a remote host over SSH, or a Docker container — plus a deterministic
//! in-memory mock for tests. One command model, one result model, one
//! failure taxonomy, regardless of where the command runs.
//!
//! ## Core concepts
//!
//! - **Safe interpolation**: templates stitch literal parts and values into
//!   a single shell line; every interpolated value is escaped so it cannot
//!   terminate its quoting context or smuggle in metacharacters. This is
//!   the crate's only injection defense and every shell path goes through
//!   it.
//! - **Adapters**: each backend implements [`adapter::ExecAdapter`]. The
//!   engine owns the instances; adapters never reference the engine back.
//! - **Bounded capture**: stdout/stderr accumulate up to a byte cap;
//!   crossing it aborts the execution instead of growing without bound.
//! - **Limits**: every execution races a wall-clock cutoff and an external
//!   cancellation token. Local kills always succeed; remote-side
//!   termination over SSH or `docker exec` is best-effort and documented as
//!   such.
//! - **Chainable views**: [`engine::Engine`] configuration methods return
//!   new views sharing the adapter instances, so SSH connection pools and
//!   container bookkeeping survive chaining.
//!
//! ## Quick start
//!
//! ```no_run
//! use uxec::{Engine, Command};
//!
//! # async fn demo() -> Result<(), uxec::ExecutionError> {
//! let engine = Engine::with_defaults();
//!
//! // Template-style: interpolated values are shell-escaped.
//! let file = "my file.txt";
//! let out = engine.run(&["cat ", ""], &[file.into()]).await?;
//! println!("{}", out.text());
//!
//! // Direct command model, chained configuration.
//! let out = engine
//!     .cd("/tmp")
//!     .timeout(5_000)
//!     .execute(Command::new("ls").arg("-la"))
//!     .await?;
//! println!("{}", out.stdout);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`quote`]: escaping and template interpolation.
//! - [`command`]: the immutable command model.
//! - [`result`] / [`error`]: structured outcomes and the failure taxonomy.
//! - [`stream`]: bounded output collection.
//! - [`adapter`]: the adapter contract and shared execution services.
//! - [`adapters`]: local, SSH, Docker, and mock backends.
//! - [`engine`]: the front-door façade and chainable configuration.
//! - [`handle`]: first-class handles to in-flight executions.
//! - [`settings`]: the `UXEC_*` environment configuration layer.

pub mod adapter;
pub mod adapters;
pub mod command;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod handle;
pub mod logging;
pub mod quote;
pub mod result;
pub mod settings;
pub mod stream;

pub use adapter::{ExecAdapter, ExecDefaults};
pub use adapters::{
    DockerAdapter, DockerAdapterConfig, LocalAdapter, MockAdapter, MockMatcher, MockResponse,
    SshAdapter, SshAdapterConfig, SshPoolStats,
};
pub use command::{
    AdapterOptions, AdapterSelector, Command, DockerOptions, ShellSpec, SshAuth, SshOptions,
    StdinSource, StdioMode, SudoOptions,
};
pub use config::EngineConfig;
pub use engine::{Engine, EngineOverrides, default_engine};
pub use error::{ExecutionError, Result};
pub use handle::RunningHandle;
pub use quote::{ShellValue, escape, escape_unix, escape_windows, interpolate};
pub use result::ExecResult;
pub use stream::{Encoding, OutputCollector};

/// Re-exported so callers can create tokens without naming `tokio-util`.
pub use tokio_util::sync::CancellationToken;
