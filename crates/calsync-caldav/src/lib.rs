mod client;
mod error;
mod multistatus;

pub use client::{CalDav, CalDavClient, CalDavSettings, CalendarInfo, RemoteEventState, RemoteEventSummary};
pub use error::CalDavError;
