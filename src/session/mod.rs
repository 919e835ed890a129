//! Session lifecycle
//!
//! The registry is the single entry point callers use to open, reuse and
//! tear down authenticated connections. Everything underneath (host-key
//! verification, the auth cascade, the transport) is wired up per attempt
//! from the collaborators injected at construction.

mod registry;

pub use registry::{SessionInfo, SessionRegistry};
