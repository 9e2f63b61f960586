//! pp-services — the storage peer's runtime pieces: correlation of
//! asynchronous answers, the file RPC bridge, peer transport and dispatch,
//! SP connection management, and background scheduling.

pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod file_rpc;
pub mod peer;
pub mod result_cache;
pub mod scheduler;
pub mod sp;
pub mod transport;

pub use connection::{Connection, ConnectionRegistry, Connector, TransportError};
pub use correlation::{Correlation, CorrelationError, Waiter};
pub use dispatch::{DispatchError, EventDispatcher, EventHandler, HandlerRegistry};
pub use file_rpc::{FileRpc, RpcError};
pub use peer::{PeerRecord, PeerStatus};
pub use result_cache::ResultCache;
pub use scheduler::Scheduler;
pub use sp::{SpError, SpIdentity, SpManager};
pub use transport::{serve, TcpConnector};
