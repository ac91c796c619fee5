//! Common utilities for usb-pmapper
//!
//! Ambient helpers shared by the port-mapper library consumers: error
//! handling, logging setup, and the channel bridge that carries events from
//! the USB service thread to an async front end.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{EventBridge, EventSink, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
