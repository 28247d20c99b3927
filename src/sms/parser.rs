//! Text-mode `+CMGL` listing decoder. Pure; no I/O.
//!
//! A listing looks like:
//!
//! ```text
//! +CMGL: 1,"REC UNREAD","+15551234567","","24/01/15,10:30:00+32"
//! Hello there
//! +CMGL: 2,"STO UNSENT","+15557654321","",
//! Draft
//!
//! OK
//! ```
//!
//! Each `+CMGL:` header starts a frame that runs to the next header or to the
//! final `OK`. A frame that cannot be decoded is skipped with a warning.

use chrono::NaiveDateTime;
use tracing::warn;

use super::message::{MessageType, SmsMessage};
use crate::error::ParseError;

const FRAME_MARKER: &str = "+CMGL: ";
const LISTING_END: &str = "\r\n\r\nOK\r\n";
const SHORT_LISTING_END: &str = "\r\nOK\r\n";

/// Messages decoded from a listing, plus the frames that were skipped.
#[derive(Debug, Default)]
pub struct ParseReport {
    pub messages: Vec<SmsMessage>,
    pub skipped: Vec<(String, ParseError)>,
}

/// Decode every well-formed record in `buffer`.
pub fn parse(buffer: &str) -> Vec<SmsMessage> {
    parse_report(buffer).messages
}

/// Like [`parse`], but also returns what was skipped and why.
pub fn parse_report(buffer: &str) -> ParseReport {
    let mut report = ParseReport::default();
    for frame in raw_frames(buffer) {
        match parse_frame(frame) {
            Ok(msg) => report.messages.push(msg),
            Err(e) => {
                warn!("SMS: skipping malformed listing entry ({e}): {:?}", frame.trim());
                report.skipped.push((frame.to_string(), e));
            }
        }
    }
    report
}

/// Split the listing region into one slice per record, markers removed.
fn raw_frames(buffer: &str) -> Vec<&str> {
    let Some(start) = buffer.find(FRAME_MARKER) else {
        return Vec::new();
    };
    let end = buffer
        .rfind(LISTING_END)
        .or_else(|| buffer.rfind(SHORT_LISTING_END))
        .filter(|&end| end >= start)
        .unwrap_or(buffer.len());

    buffer[start..end]
        .split(FRAME_MARKER)
        .filter(|frame| !frame.trim().is_empty())
        .collect()
}

fn parse_frame(frame: &str) -> Result<SmsMessage, ParseError> {
    let (header, body) = frame.split_once("\r\n").unwrap_or((frame, ""));
    let contents = body.strip_suffix("\r\n").unwrap_or(body);

    let fields: Vec<String> = header
        .split(',')
        .map(|f| f.trim().replace('"', ""))
        .collect();
    if fields.len() < 3 {
        return Err(ParseError::FieldCount {
            expected: 3,
            got: fields.len(),
        });
    }

    let index: u32 = fields[0]
        .parse()
        .map_err(|_| ParseError::Index(fields[0].clone()))?;
    let kind =
        MessageType::from_status(&fields[1]).ok_or_else(|| ParseError::Status(fields[1].clone()))?;

    let address = Some(fields[2].clone()).filter(|a| !a.is_empty());
    let (originating_address, destination_address) = if kind.is_outgoing() {
        (None, address)
    } else {
        (address, None)
    };

    let date_field = fields.get(4).map(String::as_str).unwrap_or_default();
    let time_field = fields.get(5).map(String::as_str).unwrap_or_default();
    let (date, time) = if date_field.is_empty() && kind.is_outgoing() {
        // Stored drafts carry no service-centre timestamp
        (String::new(), String::new())
    } else {
        parse_timestamp(date_field, time_field)?
    };

    Ok(SmsMessage {
        index: Some(index),
        kind,
        originating_address,
        destination_address,
        date,
        time,
        contents: contents.to_string(),
        partial_key: None,
        partial_count: None,
        partial_index: None,
        is_partial: false,
        in_device_memory: true,
        is_sent: None,
    })
}

/// `yy/MM/dd` + `hh:mm:ss±zz` → (`YYYY-MM-DD`, `HH:MM:SS`). The quarter-hour
/// zone offset is dropped; the modem's local time is kept as-is.
fn parse_timestamp(date: &str, time: &str) -> Result<(String, String), ParseError> {
    let clock = time.split(['+', '-']).next().unwrap_or_default();
    let raw = format!("{date} {clock}");
    let parsed = NaiveDateTime::parse_from_str(&raw, "%y/%m/%d %H:%M:%S")
        .map_err(|_| ParseError::Timestamp(format!("{date},{time}")))?;
    Ok((
        parsed.format("%Y-%m-%d").to_string(),
        parsed.format("%H:%M:%S").to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_MESSAGES: &str = "\r\n+CMGL: 1,\"REC UNREAD\",\"+15551234567\",\"\",\"24/01/15,10:30:00+32\"\r\nHello there\r\n+CMGL: 2,\"REC READ\",\"+15557654321\",\"\",\"23/12/31,23:59:59-08\"\r\nSecond line one\r\nline two\r\n\r\nOK\r\n";

    #[test]
    fn test_parse_two_messages() {
        let msgs = parse(TWO_MESSAGES);
        assert_eq!(msgs.len(), 2);

        assert_eq!(msgs[0].index, Some(1));
        assert_eq!(msgs[0].kind, MessageType::ReceivedUnread);
        assert_eq!(msgs[0].originating_address.as_deref(), Some("+15551234567"));
        assert_eq!(msgs[0].destination_address, None);
        assert_eq!(msgs[0].date, "2024-01-15");
        assert_eq!(msgs[0].time, "10:30:00");
        assert_eq!(msgs[0].contents, "Hello there");
        assert!(msgs[0].in_device_memory);

        assert_eq!(msgs[1].kind, MessageType::ReceivedRead);
        assert_eq!(msgs[1].date, "2023-12-31");
        assert_eq!(msgs[1].time, "23:59:59");
        assert_eq!(msgs[1].contents, "Second line one\r\nline two");
    }

    #[test]
    fn test_corrupted_header_skips_only_that_frame() {
        let corrupted = TWO_MESSAGES.replace("24/01/15,10:30:00+32", "24/13/45,99:30:00+32");
        let report = parse_report(&corrupted);
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].index, Some(2));
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(report.skipped[0].1, ParseError::Timestamp(_)));
    }

    #[test]
    fn test_numeric_status_codes() {
        let listing = "+CMGL: 7,0,\"+1555\",\"\",\"24/02/29,08:00:00+00\"\r\nleap\r\n\r\nOK\r\n";
        let msgs = parse(listing);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageType::ReceivedUnread);
        assert_eq!(msgs[0].date, "2024-02-29");
    }

    #[test]
    fn test_stored_draft_has_destination_and_no_timestamp() {
        let listing = "+CMGL: 3,\"STO UNSENT\",\"+15550001111\",\"\",\r\nDraft\r\n\r\nOK\r\n";
        let msgs = parse(listing);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageType::StoredUnsent);
        assert_eq!(msgs[0].destination_address.as_deref(), Some("+15550001111"));
        assert_eq!(msgs[0].originating_address, None);
        assert_eq!(msgs[0].date, "");
        assert_eq!(msgs[0].contents, "Draft");
    }

    #[test]
    fn test_unknown_status_and_bad_index_skipped() {
        let listing = "+CMGL: x,\"REC READ\",\"+1\",\"\",\"24/01/15,10:30:00+32\"\r\na\r\n+CMGL: 4,\"WEIRD\",\"+1\",\"\",\"24/01/15,10:30:00+32\"\r\nb\r\n+CMGL: 5,\"REC READ\",\"+1\",\"\",\"24/01/15,10:30:00+32\"\r\nc\r\n\r\nOK\r\n";
        let report = parse_report(listing);
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].contents, "c");
        assert_eq!(report.skipped[0].1, ParseError::Index("x".into()));
        assert_eq!(report.skipped[1].1, ParseError::Status("WEIRD".into()));
    }

    #[test]
    fn test_empty_listing() {
        assert!(parse("\r\nOK\r\n").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_received_message_requires_timestamp() {
        let listing = "+CMGL: 1,\"REC READ\",\"+1555\",\"\",\r\nno date\r\n\r\nOK\r\n";
        let report = parse_report(listing);
        assert!(report.messages.is_empty());
        assert!(matches!(report.skipped[0].1, ParseError::Timestamp(_)));
    }

    #[test]
    fn test_listing_with_echo_prefix() {
        let listing = format!("AT+CMGL=\"ALL\"\r{TWO_MESSAGES}");
        assert_eq!(parse(&listing).len(), 2);
    }
}
