#![forbid(unsafe_code)]
//! Poll ledger: polls, deduplicated anonymous votes and live tallies.

pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod notifier;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{AppError, LedgerError};
pub use ledger::VoteLedger;
pub use notifier::ChangeNotifier;
pub use registry::Registry;
pub use routes::build_router;
pub use state::AppState;
