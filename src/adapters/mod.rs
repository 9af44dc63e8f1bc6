//! The concrete execution backends.
//!
//! `local` spawns host processes, `ssh` drives pooled libssh2 sessions,
//! `docker` shells out to the container CLI, and `mock` answers from an
//! in-memory registry. The [`child`] submodule holds the subprocess
//! supervision shared by the local and Docker adapters.

pub mod docker;
pub mod local;
pub mod mock;
pub mod ssh;

pub(crate) mod child;

pub use docker::{DockerAdapter, DockerAdapterConfig};
pub use local::LocalAdapter;
pub use mock::{MockAdapter, MockMatcher, MockResponse};
pub use ssh::{SshAdapter, SshAdapterConfig, SshPoolStats};
