// Authentication module
// Session storage, token refresh and single-flight coordination

mod gate;
mod manager;
pub mod refresh;
pub mod store;
mod types;

pub use gate::RefreshGate;
pub use manager::SessionManager;
pub use refresh::{machine_fingerprint, AuthEndpoints};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore, SESSION_KEY};
pub use types::{Session, TokenData};
