//! Vista - a view-rendering engine for component pages.
//!
//! Compiles page components into server and client artifacts through an
//! external toolchain, caches them in memory and on disk, rebuilds them
//! when their dependencies change, and assembles complete documents on
//! demand. Builds run through a concurrency-limited scheduler that
//! deduplicates requests per page and lets interactive requests jump
//! the queue.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use vista::{Engine, EngineConfig};
//!
//! let mut config = EngineConfig::default();
//! config.dir = "pages".into();
//! config.template = "template.html".into();
//!
//! let engine = Engine::new(config)?;
//! let html = engine
//!     .render("index", &serde_json::json!({"title": "Home"}))
//!     .await?;
//! println!("{html}");
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod builder;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod page;
pub mod reload;
pub mod scheduler;
pub mod template;
pub mod utils;
pub mod watch;

#[cfg(test)]
mod testing;

pub use compiler::{CompilerService, ServerComponent};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{BuildError, RenderError};
pub use page::PageState;
pub use reload::ReloadNotice;
pub use scheduler::Priority;
