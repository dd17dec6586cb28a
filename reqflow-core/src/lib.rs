// reqflow Core Library
//
// Interfaces to the remote data/realtime service and the shared error type

pub mod error;
pub mod realtime;
pub mod source;
pub mod types;

pub use error::{ReqflowError, Result};
pub use realtime::{ChannelConfig, ChannelHandle, MemoryTransport, RealtimeEvent, RealtimeTransport};
pub use source::{DataSource, MemoryDataSource};
pub use types::{value_key, Filter, Order, QueryResult, Row, SelectQuery};
