//! rd-engine: VM backend for a desktop Kubernetes and container runtime
//!
//! Provisions a local virtual machine, runs a container engine in it and,
//! optionally, an embedded k3s cluster.  Everything is driven through a
//! single state machine that the UI, CLI or a control server talk to.
//!
//! # Key Pieces
//!
//! - **Orchestrator**: `start`, `stop`, `reset`, `del`, `factory_reset`
//!   behind one action guard ([`backend`])
//! - **VM configuration**: Lima descriptor merge and base image checks
//!   ([`vm::config`])
//! - **Privileged operations**: one consent prompt and one elevated shell per
//!   start attempt ([`sudo`])
//! - **k3s versions**: catalog, cache, downgrade confirmation ([`kube`] and
//!   the `k3s-dist` crate)
//! - **Restart reasons**: which setting changes need a restart or a reset
//!   ([`restart`])
//!
//! # Example
//!
//! ```no_run
//! use rd_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let paths = Paths::from_env()?;
//!     let ctx = AppContext::builder(paths).build();
//!     let backend = Backend::builder(ctx).spawn()?;
//!
//!     let mut settings = BackendSettings::default();
//!     settings.kubernetes.enabled = false;
//!     backend.start(settings).await?;
//!
//!     println!("state: {}", backend.state());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod kube;
pub mod paths;
pub mod process;
pub mod progress;
pub mod restart;
pub mod settings;
pub mod sudo;
pub mod vm;
pub mod watch;

// Re-exports for convenience
pub use backend::{Backend, BackendHandle, BackendState};
pub use error::{Error, Result};

// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{Action, Backend, BackendHandle, BackendState, FailureDetails};
    pub use crate::context::{AppContext, Prompter};
    pub use crate::error::{Error, Result};
    pub use crate::events::BackendEvent;
    pub use crate::paths::Paths;
    pub use crate::progress::BackendProgress;
    pub use crate::restart::{RestartReasons, Severity};
    pub use crate::settings::BackendSettings;
    pub use crate::vm::VmSupervisor;
    pub use crate::ExecOutput;
}

/// Captured result of a host subprocess
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `-1` when the process was killed by a signal
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    /// Stdout as text, invalid UTF-8 replaced
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as text with surrounding whitespace removed
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_text() {
        let output = ExecOutput::new(b"k3s version v1.29.1+k3s1\n".to_vec(), b"  warn\n".to_vec(), 0);
        assert!(output.success());
        assert_eq!(output.stdout_str(), "k3s version v1.29.1+k3s1\n");
        assert_eq!(output.stderr_str(), "warn");
    }

    #[test]
    fn signal_exit_is_failure() {
        let output = ExecOutput::new(vec![], vec![], -1);
        assert!(!output.success());
    }
}
