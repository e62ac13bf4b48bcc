//! Authentication data and session persistence.
//!
//! This module provides:
//! - `Session`: the token bundle issued by the auth service
//! - `UserProfile`/`ProfileFields`: the farmer record and sign-up details
//! - `SessionStore`: durable storage for the last session, backed by an
//!   encrypted file, the OS keychain, or memory

mod crypto;
pub mod profile;
pub mod session;
pub mod store;

pub use profile::{is_valid_email, Language, Location, ProfileFields, UserProfile, UserType};
pub use session::Session;
pub use store::{FileSessionStore, KeyringSessionStore, MemorySessionStore, SessionStore};
