//! Credential lifecycle: persistence, session ownership and renewal.

mod refresh;
mod session;
mod store;

pub use refresh::{RefreshCoordinator, RefreshPhase};
pub use session::{
    ForcedLogoutListener, Session, SessionEvent, SessionManager, UserId, UserProfile,
};
pub use store::{
    ACCESS_KEY, CredentialStore, FileCredentialStore, MemoryCredentialStore, REFRESH_KEY,
};
