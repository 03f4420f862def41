mod backend;
mod store;

pub use backend::{SessionBackend, SqliteSessionBackend, SqliteSessionBackendBuilder};
pub use store::{
    AuthSession, SessionEntry, SessionRoute, SessionStore, SessionStoreError, SessionStoreResult,
};
