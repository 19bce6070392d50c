//! Session lifecycle: status, persistence, transitions and the idle sweep.

pub mod api;
pub mod machine;
pub mod models;
pub mod store;
pub mod sweep;

pub use api::{
    cancel_session as sessions_cancel, create_session as sessions_create,
    end_session as sessions_end, estimate_session as sessions_estimate,
    get_session as sessions_get, record_activity as sessions_record_activity,
};
pub use machine::SessionStateMachine;
pub use models::{NewSession, Session, SessionStatus, SessionView, TerminationReceipt};
pub use store::{EndedAt, LeaseScope, MemorySessionStore, PgSessionStore, SessionStore};
pub use sweep::{process_tick as run_idle_sweep_tick, spawn as spawn_idle_sweep, SweepReport};
