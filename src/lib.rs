//! Mailtunnel - encrypted control channel carried over mail-relay accounts
//!
//! ## Module Organization
//!
//! - `types/`: Shared data model, command protocol and error taxonomy
//! - `config/`: On-disk configuration and unlock parameters
//! - `encryption/`: Passphrase unlock, OpenPGP identity and envelopes
//! - `probe/`: IMAP/SMTP credential probing
//! - `session/`: Channel contract, correlator, orchestrator and fallback mail
//! - `state/`: Process-scoped session manager
//! - `services/`: Account pool logic and status emission
//! - `store/`: Encrypted account pool persistence

pub mod config;
pub mod encryption;
pub mod error;
pub mod probe;
pub mod services;
pub mod session;
pub mod state;
pub mod store;
pub mod types;

pub use error::GatewayError;
pub use state::SessionManager;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// In debug builds our crate logs at debug level and everything else at
/// info. `RUST_LOG` overrides both.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mailtunnel=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // A subscriber may already be installed by the embedding application
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
