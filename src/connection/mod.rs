pub mod endpoint;
pub mod handler;
pub mod link;
pub mod state;

pub use endpoint::ConnectionEndpoint;
pub use handler::ConnectionHandler;
pub use state::ConnectionState;
