//! HSM-backed key operations.
//!
//! - [`KeyStore`]: capability interface a device binding implements
//! - [`HsmSessionManager`]: admission gate, timeouts and health state
//! - [`KeyHandle`]: what the rest of the proxy holds instead of a key
//! - [`SoftKeyStore`]: in-memory P-256 store for development and tests
//!
//! Failover between redundant HSM units is the binding's concern; the
//! session manager sees one logical device.
//!
//! # Example
//!
//! ```ignore
//! use hsm_egress::hsm::{HsmSessionManager, HsmSettings, KeyHandle, SigningAlgorithm, SoftKeyStore};
//!
//! let store = Arc::new(SoftKeyStore::new());
//! store.load_pem_file("client", Path::new("client.key"))?;
//! let hsm = Arc::new(HsmSessionManager::new(store, HsmSettings::default(), audit));
//!
//! let key = KeyHandle::new("client", SigningAlgorithm::EcdsaP256Sha256, hsm);
//! let signature = key.sign(&key.algorithm().digest(b"transcript")).await?;
//! ```

mod error;
mod handle;
mod keystore;
mod session;
mod soft;

pub use error::{HsmError, KeyStoreError};
pub use handle::KeyHandle;
pub use keystore::{KeyStore, SigningAlgorithm};
pub use session::{HsmHealth, HsmSessionManager, HsmSettings};
pub use soft::SoftKeyStore;
