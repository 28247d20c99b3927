//! SMS listing, sending, and deletion in text mode.
//!
//! Sending holds the correlator lock for the whole prompt handshake:
//! `AT+CMGS="<to>"` → `>` → body → Ctrl-Z → `+CMGS: <mr>`. Nothing else can
//! reach the modem while it is waiting for a body.

pub mod message;
pub mod parser;

use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::Error;

pub use message::{MessageType, SmsFilter, SmsMessage};

/// Ends the body in text mode.
const CTRL_Z: u8 = 0x1A;
/// Aborts a pending `>` prompt.
const ESC: u8 = 0x1B;
/// Message reference line, sent only once the network accepted the message.
const SEND_CONFIRMATION: &str = "+CMGS:";

/// Deadlines for SMS exchanges.
#[derive(Debug, Clone, Copy)]
pub struct SmsTimeouts {
    /// Listing, delete, and the `>` prompt.
    pub command: Duration,
    /// Network confirmation after Ctrl-Z.
    pub send: Duration,
}

impl Default for SmsTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(5),
            send: Duration::from_secs(30),
        }
    }
}

/// SMS subsystem. Holds a handle on the shared correlator.
pub struct Sms {
    modem: Correlator,
    timeouts: SmsTimeouts,
}

impl Sms {
    #[must_use]
    pub fn new(modem: Correlator, timeouts: SmsTimeouts) -> Self {
        Self { modem, timeouts }
    }

    /// List stored messages matching `filter`.
    pub async fn list(&self, filter: SmsFilter) -> Result<Vec<SmsMessage>, Error> {
        let command = format!("AT+CMGL=\"{}\"", filter.as_at());
        let resp = self
            .modem
            .exchange(&command, "\r\nOK\r\n", self.timeouts.command)
            .await?;

        let mut messages = parser::parse(&resp);
        for msg in &mut messages {
            msg.in_device_memory = true;
        }
        info!("SMS: {} message(s) listed ({filter})", messages.len());
        Ok(messages)
    }

    /// Send `text` to `destination`. Returns whether the modem confirmed
    /// transmission; every failure is logged and reported as `false`.
    pub async fn send(&self, destination: &str, text: &str) -> bool {
        match self.try_send(destination, text).await {
            Ok(()) => {
                info!("SMS: sent to {destination} ({} chars)", text.chars().count());
                true
            }
            Err(e) => {
                warn!("SMS: send to {destination} failed: {e}");
                false
            }
        }
    }

    async fn try_send(&self, destination: &str, text: &str) -> Result<(), Error> {
        let command = format!("AT+CMGS=\"{destination}\"");
        if text.bytes().any(|b| b == CTRL_Z || b == ESC) {
            return Err(Error::Protocol {
                command,
                response: "body contains a Ctrl-Z or ESC control byte".into(),
            });
        }

        let mut link = self.modem.lock().await;
        if let Err(e) = link.exchange(&command, ">", self.timeouts.command).await {
            // The prompt may still arrive; make sure the modem leaves it
            if !matches!(e, Error::Transport(_)) {
                let _ = link.write_raw(&[ESC]);
                let _ = link.clear();
            }
            return Err(e);
        }

        debug!("SMS: prompt received, writing body");
        link.write_raw(text.as_bytes())?;
        link.write_raw(&[CTRL_Z])?;
        // With echo on, the body comes back first and may contain anything
        link.wait_for(&command, Some(text), SEND_CONFIRMATION, self.timeouts.send)
            .await?;
        Ok(())
    }

    /// Send and build the outbound record for the upstream store.
    pub async fn send_message(&self, destination: &str, text: &str) -> SmsMessage {
        let sent = self.send(destination, text).await;
        let now = Local::now();
        SmsMessage {
            index: None,
            kind: if sent {
                MessageType::Sent
            } else {
                MessageType::StoredUnsent
            },
            originating_address: None,
            destination_address: Some(destination.to_string()),
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            contents: text.to_string(),
            partial_key: None,
            partial_count: None,
            partial_index: None,
            is_partial: false,
            in_device_memory: false,
            is_sent: Some(sent),
        }
    }

    /// Delete the message in storage slot `index`.
    pub async fn delete(&self, index: u32) -> bool {
        match self
            .modem
            .exchange(&format!("AT+CMGD={index}"), "OK", self.timeouts.command)
            .await
        {
            Ok(_) => {
                info!("SMS: deleted message {index}");
                true
            }
            Err(e) => {
                warn!("SMS: delete {index} failed: {e}");
                false
            }
        }
    }
}
