//! Local persistence for the chat client.
//!
//! Values live in a namespaced string key/value store; [`ClientStateStore`]
//! layers the session id, offline history backup, and preferences on top.

pub mod client_state;
pub mod export;
pub mod store;

pub use client_state::{ClientStateStore, Preferences, PreferencesPatch, STORE_NAMESPACE, Theme};
pub use export::{SessionMetadata, render_transcript};
pub use store::{FileStore, InMemoryStore, KeyValueStore, ScopedStore, StoreError};
