//! Keel State Management
//!
//! This crate persists what reconcilers remember between runs: the remote
//! identifier of each managed resource and the desired state last applied to
//! it. Remote state itself is never stored; it is read fresh on every pass.
//!
//! # Overview
//!
//! - **StateFile**: all resource records of one workspace
//! - **StateBackend**: a trait for state storage backends (currently local files)
//! - **LockInfo**: information about state locks for concurrent access control
//!
//! # Example
//!
//! ```ignore
//! use keel_state::{create_backend, BackendConfig, ResourceRecord};
//!
//! let backend = create_backend(&BackendConfig::local("keel.state.json")).await?;
//! let lock = backend.acquire_lock("apply").await?;
//!
//! let mut state = backend.read_state().await?.unwrap_or_default();
//! state.upsert_resource(ResourceRecord::new(reconciler.id(), "memory", reconciler.snapshot()));
//! state.increment_serial();
//! backend.write_state(&state).await?;
//!
//! backend.release_lock(&lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;

pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, create_backend};
pub use lock::LockInfo;
pub use state::{ResourceRecord, StateFile};
