//! HTTP control plane: the composition root, request authentication,
//! error mapping, and the route modules.

pub mod authn;
pub mod daemon;
pub mod error;
pub mod routes;
pub mod state;

pub use daemon::serve;
pub use routes::build_router;
pub use state::{AppState, KillSwitch};
