//! Background IMAP synchronization engine.
//!
//! A [`supervisor::Supervisor`] keeps one [`account::AccountOrchestrator`]
//! per active user. Each orchestrator runs one Folder Session per tracked
//! remote folder and reconciles what they detect into the [`store::Store`].

pub mod account;
pub mod config;
pub mod constants;
pub mod error;
pub mod mail;
pub mod store;
pub mod supervisor;

pub use account::{EngineContext, EngineNotice, Pipeline};
pub use config::Config;
pub use error::{FailureKind, SessionError, SyncError};
pub use store::Store;
pub use supervisor::{Supervisor, Trigger};
