pub mod session;
pub mod sink;
pub mod store;
pub mod tracker;
pub mod ua;

pub use session::{Codec, Quality, Session, UaFields, enrich, parse_chunk_basename, parse_ip};
pub use sink::{SinkAdapter, SinkConnection, SinkError, SinkValue};
pub use store::SessionStore;
pub use tracker::Tracker;
pub use ua::UaParser;
