//! Decided message synchronization: the requester that catches a node up with
//! its peers and the handlers answering the same queries from local storage.

mod error;
pub mod handlers;
mod history;
pub mod messages;
pub mod validation;

pub use error::Error;
pub use handlers::register_sync_handlers;
pub use history::History;
pub use messages::{StatusCode, SyncMessage, SyncProtocol};
pub use validation::{
    combine, decided_pipeline, wrap_func, CommitteeRegistry, Pipeline, ValidationError,
};
