//! HTTP/WS gateway — the external surface of the execution core.
//!
//! Every handler authenticates with a JWT and scopes reads to the
//! authenticated owner; cross-tenant access answers 404, never 403, so
//! resource existence does not leak.

pub mod auth;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use auth::{AuthMode, Claims, ResolvedAuth};
pub use server::{build_router, build_state, start_gateway, GatewaySettings};
pub use state::AppState;
