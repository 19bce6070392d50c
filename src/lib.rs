pub mod billing;
pub mod config;
pub mod error;
pub mod routes;
pub mod sessions;
pub mod state;

pub use config::BillingConfig;
pub use error::{AppError, AppResult};
pub use state::AppState;
