//! Command/response correlation engine for line-oriented serial links.
//!
//! This crate lets a controlling process issue textual commands to a
//! microcontroller over a serial link and correlate each command with the
//! response line that acknowledges it, with bounded waiting and safe
//! cancellation when the link drops.
//!
//! # Architecture
//!
//! - [`Dispatcher`]: subscribe/notify hub for one event kind. The transport
//!   feeds one dispatcher with inbound lines and a second one with the
//!   link-loss signal; both are bundled in a [`MessageExchange`].
//! - [`ResponseWaiter`]: blocks a thread until a specific line arrives or a
//!   timeout elapses. Matching is strict equality, and one notification
//!   satisfies every waiter registered for that line.
//! - [`WatchdogCommand`]: sends a command line, then runs the wait for its
//!   acknowledgement on a bounded worker so link loss can cancel it.
//! - [`SerialLink`]: `serialport`-backed transport binding with a reader
//!   thread doing the line framing.
//!
//! # Example
//!
//! ```rust,ignore
//! use cmdlink::{ControllerCommand, MessageExchange, SerialConfig, SerialLink, WatchdogCommand};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let exchange = MessageExchange::new();
//! let link = Arc::new(SerialLink::open(&SerialConfig::new("/dev/ttyACM0"), exchange.clone())?);
//!
//! let open = WatchdogCommand::from_spec(link.clone(), &exchange,
//!     &ControllerCommand::OpenShutter.spec())?
//!     .with_timeout(Duration::from_secs(5));
//! open.run(None)?; // sends "open_shutter", waits for "shutter_opened"
//! ```

mod catalog;
mod command;
mod dispatch;
mod error;
mod exchange;
mod serial;
mod waiter;
mod worker;

pub use catalog::*;
pub use command::*;
pub use dispatch::*;
pub use error::*;
pub use exchange::*;
pub use serial::*;
pub use waiter::*;
pub use worker::*;
