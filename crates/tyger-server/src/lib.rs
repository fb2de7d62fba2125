//! HTTP API + process wiring: the external interface from spec §6, wired
//! up from every other component crate, plus the local data-plane server
//! and background subsystem startup.

pub mod background;
pub mod error;
pub mod handlers;
pub mod local_dataplane;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
