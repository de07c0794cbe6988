//! Persistent node identity
//!
//! The node's Ed25519 keypair is stored once per data directory and reused on
//! every start, so the derived peer ID is stable across restarts.

mod store;

pub use store::{identity_path, load_or_create, IdentityError, IDENTITY_FILE};
