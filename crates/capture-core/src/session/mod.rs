//! Session state, registry and the per-session driver

mod driver;
mod registry;
mod state;

pub use driver::{CloseCause, SessionContext, SessionDriver, SessionEvent};
pub use registry::{SessionEntry, SessionRegistry};
pub use state::{ArtifactKeys, SessionState};
