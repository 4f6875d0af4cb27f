mod handlers;
mod server;
mod types;

pub use server::RpcServer;
pub use types::*;
