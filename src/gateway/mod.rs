pub mod service;
pub mod tunnel;

pub use service::{AccessNotification, GatewayService, GatewaySettings};
pub use tunnel::{TunnelManager, TunnelSpec};
