//! Runner Pool Controller
//!
//! Keeps a fixed number of ephemeral self-hosted CI runner containers alive
//! on a Docker host. Whenever a worker exits the controller notices the
//! runtime event and starts a replacement; on SIGINT/SIGTERM it asks every
//! worker to deregister before the process exits.
//!
//! # Key Features
//!
//! - **Event driven** - reconciles only on startup and on worker exit
//! - **Bounded pool** - never starts more workers than the configured limit
//! - **Two auth modes** - static personal access token or App installation
//!   tokens refreshed lazily on expiry
//! - **Graceful drain** - runs the in-container stop script on shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runner_pool::{shutdown, Controller, DockerRuntime, Settings};
//!
//! # async fn example() -> runner_pool::Result<()> {
//! let settings = Settings::load("config.json")?;
//! let runtime = Arc::new(DockerRuntime::connect(&settings.container_host)?);
//!
//! let controller = Controller::start(settings, runtime).await?;
//! controller.run(shutdown::termination_signal()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod image;
pub mod pool;
pub mod runtime;
pub mod secret;
pub mod shutdown;
pub mod watcher;

pub use config::{AuthMode, PoolTarget, RunnerSpec, RunnerTarget, Settings};
pub use controller::Controller;
pub use credential::{Credential, CredentialManager};
pub use error::{ConfigError, Error, Result};
pub use image::{ImageProvisioner, ImageReference};
pub use pool::PoolReconciler;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use shutdown::ShutdownCoordinator;
pub use watcher::EventWatcher;
