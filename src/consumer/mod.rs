// Event consumer module
//
// Polls one broker channel, validates each event and hands it to a sink
// handler. Failed events are logged and dropped, never re-enqueued.

pub mod dispatch;
pub mod upload;

pub use dispatch::{ConsumerStats, DispatchOutcome, EventConsumer, EventHandler};
pub use upload::{object_key, UploadHandler, UNCLASSIFIED_PREFIX};
