//! Outbound mutual TLS with HSM-held client keys.
//!
//! - [`TlsSessionFactory`] connects to a destination and runs the handshake
//! - [`HsmSigningKey`] hands rustls the one signature a client makes,
//!   produced by the HSM through the identity's key handle
//! - [`TlsPolicy`] validates the upstream chain against the route's anchors
//!
//! # Example
//!
//! ```ignore
//! use hsm_egress::tls::{FactorySettings, TlsSessionFactory};
//!
//! let factory = TlsSessionFactory::new(FactorySettings::default());
//! let identity = identities.get_active(&destination.identity)?;
//! let transport = factory.connect(&destination, identity).await?;
//! ```

mod error;
mod factory;
mod pem;
mod signer;
mod verifier;

pub use error::TlsError;
pub use factory::{FactorySettings, TlsSessionFactory, TlsTransport};
pub use pem::{read_certs, read_root_store, system_roots};
pub use signer::{FailureSlot, HsmSigner, HsmSigningKey, PinnedClientCert};
pub use verifier::{AnchoredServerVerifier, HostnameVerification, TlsPolicy};
