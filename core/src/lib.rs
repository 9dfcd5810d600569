//! `flow-core`: tab-lock enforcement for the Flow focus extension.
//!
//! A user locks themself into one browser tab; while locked, every attempt to
//! activate another tab, open a new tab or focus another window is reverted
//! and counted against the running focus session.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `ids` | Canonical tab/window identifiers |
//! | `store` | Key-value state store seam, in-memory and JSON-file stores |
//! | `browser` | Browser-control seam and classified browser errors |
//! | `session` | Focus-session records, notes and history |
//! | `policy` | Pure decisions: lock state + event → effects |
//! | `retry` | Switch-back backoff and debounce guard |
//! | `engine` | Lock enforcement engine (executes effects) |
//! | `router` | Command router for UI intents |
//! | `notify` | Messages and notifications sent to the presentation layer |
//! | `config` | Layered configuration (defaults → TOML → env) |

pub mod browser;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ids;
pub mod notify;
pub mod policy;
pub mod retry;
pub mod router;
pub mod session;
pub mod state;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use browser::{BrowserControl, BrowserError, BrowserErrorKind, Tab};
pub use engine::{Engine, SessionEndReason};
pub use ids::{TabId, WindowId};
pub use router::{Command, CommandResponse, CommandRouter};
pub use session::{Note, Session, SessionManager};
pub use state::LockState;
pub use store::{FileStore, MemoryStore, StateStore, Storage};
