//! Modem setup commands and the status snapshot.
//!
//! Setup runs once at startup (SIM check, verbose errors, SMS text mode and
//! storage). The snapshot is a best-effort read of identity and network
//! state: one failing query leaves its field empty instead of failing the
//! whole report.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::Error;

const CONFIG_DUMP: &str = "AT&V";

/// `AT+CSCS` character sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ira,
    Gsm,
    Ucs2,
}

impl Charset {
    fn as_at(self) -> &'static str {
        match self {
            Self::Ira => "IRA",
            Self::Gsm => "GSM",
            Self::Ucs2 => "UCS2",
        }
    }
}

/// `+CREG` `<stat>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

/// Point-in-time view of the modem.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModemStatus {
    /// Answered a bare `AT`.
    pub responsive: bool,
    pub sim_ready: bool,
    /// Own number from `AT+CNUM`, when the SIM stores one.
    pub phone_number: Option<String>,
    /// RSSI in dBm (from AT+CSQ).
    pub rssi_dbm: Option<i32>,
    pub registration: Option<Registration>,
    /// Network operator name (from AT+COPS?).
    pub operator: Option<String>,
    /// Trimmed reply per command, for anything not decoded above.
    pub raw: BTreeMap<String, String>,
}

/// Setup and status queries. Holds a handle on the shared correlator.
pub struct Device {
    modem: Correlator,
    timeout: Duration,
}

impl Device {
    #[must_use]
    pub fn new(modem: Correlator, timeout: Duration) -> Self {
        Self { modem, timeout }
    }

    async fn ok(&self, command: &str) -> Result<String, Error> {
        self.modem.exchange(command, "OK", self.timeout).await
    }

    /// `AT+CPIN?` reports READY. A CME error (no SIM) counts as not ready.
    pub async fn sim_ready(&self) -> Result<bool, Error> {
        match self.ok("AT+CPIN?").await {
            Ok(resp) => Ok(resp.contains("READY")),
            Err(Error::Protocol { response, .. }) => {
                debug!("SIM: not ready ({response})");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Verbose `+CME ERROR` strings instead of numeric codes.
    pub async fn enable_verbose_errors(&self) -> Result<(), Error> {
        self.ok("AT+CMEE=2").await.map(|_| ())
    }

    /// Store messages in `area` (`SM` = SIM, `ME`/`MT` = modem flash).
    pub async fn set_sms_storage(&self, area: &str) -> Result<(), Error> {
        self.ok(&format!("AT+CPMS=\"{area}\",\"{area}\",\"{area}\""))
            .await
            .map(|_| ())
    }

    /// Text mode (`true`) or PDU mode.
    pub async fn set_text_mode(&self, text: bool) -> Result<(), Error> {
        self.ok(&format!("AT+CMGF={}", u8::from(text))).await.map(|_| ())
    }

    pub async fn set_charset(&self, charset: Charset) -> Result<(), Error> {
        self.ok(&format!("AT+CSCS=\"{}\"", charset.as_at()))
            .await
            .map(|_| ())
    }

    /// Active settings profile from `AT&V`, without echo or the final `OK`.
    pub async fn config_dump(&self) -> Result<String, Error> {
        let resp = self.ok(CONFIG_DUMP).await?;
        let body = resp.trim();
        let body = body.strip_prefix(CONFIG_DUMP).unwrap_or(body);
        let body = body.strip_suffix("OK").unwrap_or(body);
        Ok(body.trim().to_string())
    }

    /// Startup gate: the SIM must be ready. Verbose errors are nice to have.
    pub async fn initial_checks(&self) -> Result<(), Error> {
        if !self.sim_ready().await? {
            return Err(Error::Protocol {
                command: "AT+CPIN?".into(),
                response: "SIM not ready".into(),
            });
        }
        if let Err(e) = self.enable_verbose_errors().await {
            warn!("Modem: could not enable verbose errors: {e}");
        }
        info!("Modem: SIM ready");
        Ok(())
    }

    /// Put the SMS side into a known state: text mode, IRA charset, storage.
    pub async fn prepare_sms(&self, storage: &str, text_mode: bool) -> Result<(), Error> {
        self.set_text_mode(text_mode).await?;
        if let Err(e) = self.set_charset(Charset::Ira).await {
            warn!("Modem: charset not set: {e}");
        }
        self.set_sms_storage(storage).await?;
        debug!("SMS: storage {storage}, text mode {text_mode}");
        Ok(())
    }

    /// Query identity and network state.
    pub async fn status(&self) -> Result<ModemStatus, Error> {
        let mut status = ModemStatus::default();

        for command in ["AT", "AT+CPIN?", "AT+CNUM", "AT+CSQ", "AT+CREG?", "AT+COPS?"] {
            let resp = match self.ok(command).await {
                Ok(resp) => resp,
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => {
                    debug!("Status: {command} failed: {e}");
                    continue;
                }
            };

            match command {
                "AT" => status.responsive = true,
                "AT+CPIN?" => status.sim_ready = resp.contains("READY"),
                "AT+CNUM" => status.phone_number = parse_cnum(&resp),
                "AT+CSQ" => status.rssi_dbm = parse_csq(&resp),
                "AT+CREG?" => status.registration = parse_creg(&resp),
                "AT+COPS?" => status.operator = parse_cops(&resp),
                _ => {}
            }
            status.raw.insert(command.to_string(), resp.trim().to_string());
        }

        Ok(status)
    }
}

// ── Parsers ──────────────────────────────────────────────────────────

/// Parse `AT+CSQ` response → RSSI in dBm. `None` for 99 (not detectable).
fn parse_csq(response: &str) -> Option<i32> {
    let line = response.lines().find(|l| l.contains("+CSQ:"))?;
    let rssi_raw: i32 = line
        .split(':')
        .nth(1)?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()?;

    if rssi_raw == 99 {
        return None;
    }
    Some(-113 + 2 * rssi_raw)
}

/// Parse `AT+CREG?` → `+CREG: <n>,<stat>`.
fn parse_creg(response: &str) -> Option<Registration> {
    let line = response.lines().find(|l| l.contains("+CREG:"))?;
    let stat = line.split(':').nth(1)?.split(',').nth(1)?.trim();
    Some(match stat {
        "0" => Registration::NotRegistered,
        "1" => Registration::Home,
        "2" => Registration::Searching,
        "3" => Registration::Denied,
        "5" => Registration::Roaming,
        _ => Registration::Unknown,
    })
}

/// Parse `AT+CNUM` → `+CNUM: "<alpha>","<number>",<type>`.
fn parse_cnum(response: &str) -> Option<String> {
    let line = response.lines().find(|l| l.contains("+CNUM:"))?;
    let number = line
        .split(':')
        .nth(1)?
        .split(',')
        .nth(1)?
        .trim()
        .trim_matches('"');
    (!number.is_empty()).then(|| number.to_string())
}

/// Parse `AT+COPS?` → operator name.
///
/// Response: `+COPS: 0,0,"ROGERS ROGERS",7`
fn parse_cops(response: &str) -> Option<String> {
    let line = response.lines().find(|l| l.contains("+COPS:"))?;
    let data = line.split(':').nth(1)?.trim();
    let start = data.find('"')? + 1;
    let end = data[start..].find('"')? + start;
    let name = data[start..end].trim();
    if name.is_empty() {
        return None;
    }
    // "ROGERS ROGERS" → "Rogers"
    let words: Vec<&str> = name.split_whitespace().collect();
    if words.len() >= 2 && words[0].eq_ignore_ascii_case(words[1]) {
        Some(titlecase(words[0]))
    } else {
        Some(titlecase(name))
    }
}

/// Title-case a string: "ROGERS" → "Rogers".
fn titlecase(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => {
            let upper: String = c.to_uppercase().collect();
            upper + &chars.as_str().to_lowercase()
        }
    }
}
