//! # Seal-Keyring: Symmetric Key Lifecycle Management
//!
//! `seal-keyring` creates, rotates, retires and destroys symmetric data keys,
//! uses them for authenticated encryption of opaque payloads, and re-encrypts
//! previously encrypted documents after a rotation.
//!
//! ## Core Concepts
//!
//! - **`FileKeyStore`**: encrypted-at-rest key storage with atomic writes,
//!   timestamped backups and best-effort secure deletion.
//! - **`KeyLifecycleManager`**: owns the key table and its
//!   `Active -> Enabled -> Disabled -> Deleted` state machine; encrypts with
//!   the Active key and decrypts with any key that is still allowed to.
//! - **`RotationOrchestrator`**: rotates once, then sweeps a batch of documents
//!   onto the new key, isolating failures per document.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use secrecy::{SecretBox, SecretString};
//! use seal_keyring::{ConfigFile, FileKeyStore, KeyLifecycleManager, KeyStorage};
//!
//! fn main() -> Result<(), seal_keyring::Error> {
//!     let config = ConfigFile::default();
//!     let store: Arc<dyn KeyStorage> = Arc::new(FileKeyStore::open(
//!         config.storage.clone(),
//!         SecretBox::new(Box::from(&b"storage-level secret"[..])),
//!     )?);
//!     let master = SecretString::from("master secret");
//!     let manager = KeyLifecycleManager::new(&config, master, store)?;
//!     manager.init()?;
//!
//!     let payload = manager.encrypt(b"Hello, Seal-Keyring!")?;
//!     assert_eq!(manager.decrypt(&payload)?, b"Hello, Seal-Keyring!");
//!
//!     manager.rotate_keys()?;
//!     assert_eq!(manager.decrypt(&payload)?, b"Hello, Seal-Keyring!");
//!     Ok(())
//! }
//! ```

pub mod common;
pub mod document;
pub mod error;
pub mod lifecycle;
pub mod rotation;
pub mod storage;
pub mod symmetric;

pub use common::{
    ConfigFile, DeletionPolicy, EncryptedPayload, KdfConfig, KeyMetadata, KeyRecord, KeyStatus,
    KeyStorage, RotationPolicy, StorageConfig, SweepConfig,
};
pub use document::EncryptedDocumentStore;
pub use error::{Error, StorageError};
pub use lifecycle::{KeyLifecycleManager, RotationSummary};
pub use rotation::{CancellationFlag, DocumentStore, ReencryptionReport, RotationOrchestrator};
#[cfg(feature = "async")]
pub use rotation::{AsyncDocumentStore, AsyncRotationOrchestrator};
pub use storage::{EncryptedKeyContainer, FileKeyStore};

/// The version of the `seal-keyring` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
