pub mod auth;
pub mod authorize;
pub mod bridge;
pub mod channel;
pub mod frame;
pub mod pipe;
pub mod services;
pub mod session;
pub mod transport;

pub use auth::Auth;
pub use bridge::Bridge;
pub use services::Services;
pub use session::{BrowserInput, DefaultTransportFactory, GatewayService, TransportFactory};
