//! # tether-session — auth sessions with per-user profile documents
//!
//! ```text
//! ┌──────────────┐ Option<CurrentUser> ┌─────────┐ session_started ┌────────────────┐
//! │ AuthProvider │ ──────────────────► │ Session │ ──────────────► │ ProfileSession │
//! │ (injected)   │                     │         │ session_ended   │ DocumentMirror │
//! └──────────────┘                     └─────────┘                 └───────┬────────┘
//!                                                                          │
//!                                                      "profile/<uid>" ◄───┘ RemoteStore
//! ```
//!
//! - [`provider`] — the auth backend contract
//! - [`memory`] — in-process auth backend
//! - [`session`] — session state machine and lifecycle hooks
//! - [`profile`] — profile document bound to the session lifecycle

pub mod memory;
pub mod profile;
pub mod provider;
pub mod session;
mod util;

pub use memory::MemoryAuth;
pub use profile::{ProfileConfig, ProfileFactory, ProfileSession, ProfileSnapshot};
pub use provider::{AuthError, AuthProvider, AuthStateReceiver, Credential, CurrentUser};
pub use session::{
    Session, SessionConfig, SessionError, SessionObserver, SessionSnapshot, SessionState,
};
