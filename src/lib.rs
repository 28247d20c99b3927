#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! simcomd library. AT command engine for SIMCOM SIM7600-class modems.
//!
//! - `transport`: raw serial link (termios) and device detection
//! - `correlator`: command/response matching, exclusive link access,
//!   background poll queue
//! - `gps`: GNSS session state machine and fix acquisition
//! - `sms`: text-mode listing, sending, deletion; `+CMGL` parser
//! - `device`: SIM/SMS setup and the status snapshot
//! - `config`: configuration loading
//! - `error`: error types

pub mod config;
pub mod correlator;
pub mod device;
pub mod error;
pub mod gps;
pub mod sms;
pub mod transport;
pub mod util;

#[cfg(test)]
mod sim;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use correlator::{Correlator, PollHandle, PollOutcome};
pub use device::{Device, ModemStatus};
pub use error::{Error, ParseError};
pub use gps::{FixOutcome, Gps, GpsFix, GpsSessionState};
pub use sms::{MessageType, Sms, SmsFilter, SmsMessage};
pub use transport::{SerialLink, Transport};
