//! TCP transport for the ASTM side of the bridge.

pub mod server;

pub use server::AstmTcpServer;
