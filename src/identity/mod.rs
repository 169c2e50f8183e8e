//! Client identities and their lifecycle.
//!
//! An [`Identity`] pairs a certificate chain with the [`KeyHandle`] of its
//! private key. The [`CertificateStore`] holds the active identity per
//! logical name, validates replacements before swapping them in and polls
//! for identities approaching expiry. It never fetches certificates itself;
//! rotation tooling hands it new material through [`CertificateStore::rotate`].
//!
//! [`DevPki`] produces throwaway CA, server and client material for
//! development setups and tests.
//!
//! [`KeyHandle`]: crate::hsm::KeyHandle

mod dev_pki;
mod error;
mod material;
mod store;

pub use dev_pki::{DevPki, DevPkiFiles, IssuedCert};
pub use error::{DevPkiError, IdentityError};
pub use material::Identity;
pub use store::{CertificateStore, DEFAULT_RENEWAL_FRACTION, RenewalFlag, RetainedIdentity};
