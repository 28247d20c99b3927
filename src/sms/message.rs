//! SMS record and listing filter types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage status of a message, as in `+CMGL` `<stat>`, plus `Sent` for
/// records created locally after a confirmed `AT+CMGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ReceivedUnread,
    ReceivedRead,
    StoredUnsent,
    StoredSent,
    Sent,
}

impl MessageType {
    /// Decode a listing status: numeric (`0`..`3`) or the text-mode name.
    #[must_use]
    pub fn from_status(status: &str) -> Option<Self> {
        match status.trim() {
            "0" | "REC UNREAD" => Some(Self::ReceivedUnread),
            "1" | "REC READ" => Some(Self::ReceivedRead),
            "2" | "STO UNSENT" => Some(Self::StoredUnsent),
            "3" | "STO SENT" => Some(Self::StoredSent),
            _ => None,
        }
    }

    /// Stored (outgoing) records carry a destination, not an originator.
    #[must_use]
    pub fn is_outgoing(self) -> bool {
        matches!(self, Self::StoredUnsent | Self::StoredSent | Self::Sent)
    }
}

/// One SMS, either observed in modem storage or composed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    /// Storage slot on the modem. `None` for messages never stored there.
    pub index: Option<u32>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub originating_address: Option<String>,
    pub destination_address: Option<String>,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM:SS`
    pub time: String,
    pub contents: String,
    pub partial_key: Option<String>,
    pub partial_count: Option<u32>,
    pub partial_index: Option<u32>,
    pub is_partial: bool,
    /// Seen in modem storage (SIM or flash).
    pub in_device_memory: bool,
    /// Modem confirmed transmission. `None` when unknown.
    pub is_sent: Option<bool>,
}

/// `AT+CMGL` selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmsFilter {
    #[default]
    All,
    ReceivedUnread,
    ReceivedRead,
    StoredUnsent,
    StoredSent,
}

impl SmsFilter {
    /// Text-mode `<stat>` argument.
    #[must_use]
    pub fn as_at(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::ReceivedUnread => "REC UNREAD",
            Self::ReceivedRead => "REC READ",
            Self::StoredUnsent => "STO UNSENT",
            Self::StoredSent => "STO SENT",
        }
    }
}

impl fmt::Display for SmsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_at())
    }
}

impl FromStr for SmsFilter {
    type Err = String;

    /// Accepts the AT names (`"REC UNREAD"`) and CLI spellings
    /// (`rec-unread`, `unread`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        match normalized.as_str() {
            "all" => Ok(Self::All),
            "rec unread" | "unread" => Ok(Self::ReceivedUnread),
            "rec read" | "read" => Ok(Self::ReceivedRead),
            "sto unsent" | "unsent" => Ok(Self::StoredUnsent),
            "sto sent" | "sent" => Ok(Self::StoredSent),
            _ => Err(format!(
                "unknown filter {s:?} (expected all, rec-unread, rec-read, sto-unsent, sto-sent)"
            )),
        }
    }
}
