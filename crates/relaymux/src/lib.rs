pub mod config;
pub mod directory;
mod error;
pub mod filter;
mod note;
pub mod optimizer;
pub mod query;
pub mod relay;
pub mod selector;
mod system;

#[cfg(test)]
mod test_utils;

pub use config::QueryConfig;
pub use directory::{RelayDirectory, RelayListCache, RelaySpec};
pub use error::Error;
pub use filter::{Filter, FilterBuilder, RequestBuilder, RequestBuilderOptions};
pub use note::Note;
pub use optimizer::{DefaultQueryOptimizer, QueryOptimizer};
pub use query::{
    spawn_query, GateRejection, NoteCollection, NoteStore, Query, QueryCommand, QueryHandle,
    QueryOptions, QueryStatus, QueryTrace, TraceReport, TraceState,
};
pub use relay::pool::RelayPool;
pub use relay::websocket::WebsocketRelay;
pub use relay::{Connection, NormRelayUrl, RelayReqId, RelayStatus, SentCallback, TransportEvent};
pub use selector::{BuiltReqFilter, EndpointSelector, RequestStrategy};
pub use system::QueryManager;

pub type Result<T> = std::result::Result<T, error::Error>;
