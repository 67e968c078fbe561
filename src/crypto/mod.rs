// Cryptographic primitives: hybrid key agreement, key schedule, packet protection
// and peer authentication.

pub mod kdf;
pub mod kex;
pub mod mac;
pub mod packet;
pub mod trust;

pub use kdf::{KeySet, MasterSecret, SessionKeys};
pub use kex::{HybridKeyExchange, KeyExchange, KeyPair, Role, SharedSecret};
pub use trust::{Psk, TrustStore};
