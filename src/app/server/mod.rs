pub mod automator;
pub mod lifecycle;
pub mod rpc;
#[cfg(test)]
pub mod testing;

pub use automator::{AutomatorDevice, Selector};
pub use lifecycle::{AutomatorServer, ServerOptions, ServerState};
pub use rpc::{RpcClient, StubEndpoint};
