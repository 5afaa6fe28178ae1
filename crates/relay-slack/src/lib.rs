pub mod api;
pub mod error;
pub mod events;
pub mod handler;

pub use api::SlackClient;
pub use error::SlackError;
pub use events::{EventEnvelope, MessageEvent, SlackEvent};
pub use handler::{EventRouter, Route, ThreadRoots};
