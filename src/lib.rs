//! # Converge
//!
//! Host-side pieces for running declarative infrastructure programs:
//!
//! - [`config`]: `converge.toml`, stage resolution, backend and vault wiring
//! - [`state`]: file and SQLite state backends
//! - [`program`]: run a program against a stage, aborting on Ctrl-C
//! - [`logging`]: `env_logger` setup
//! - [`paths`]: config and state directory resolution
//!
//! The reconciliation engine itself lives in the [`declarative`] crate and
//! is re-exported here along with [`secretkit`] and [`retrykit`].
//!
//! ```ignore
//! use converge::config::ConvergeConfig;
//!
//! converge::logging::init(1, false);
//! let config = ConvergeConfig::load()?;
//! let stage = config.resolve_stage()?;
//! let engine = config
//!     .engine_builder(&stage)?
//!     .handler(BucketHandler::new(client))
//!     .build()?;
//!
//! let run = engine.begin_with(stage, config.run_options()).await?;
//! let report = converge::program::run_program(run, |root| async move {
//!     root.resource::<BucketHandler>("assets", props).await?;
//!     Ok(())
//! })
//! .await?;
//! ```

pub mod config;
pub mod logging;
pub mod paths;
pub mod program;
pub mod state;

pub use declarative;
pub use retrykit;
pub use secretkit;

pub use config::ConvergeConfig;
pub use program::{run_program, run_program_until};
