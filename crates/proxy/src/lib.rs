//! Proxy-side runtime: load scoring and the player route dispatcher.

mod router;
mod score;

pub use router::{
    BusPlayerTransport, PlayerTransport, ProxyDrain, RouteAssignment, RouteDispatcher,
    RouteError, MAX_ATTEMPTS, PROVISION_TIMEOUT,
};
pub use score::{load_score, rank};
