//! GPS session control and fix retrieval via SIMCOM `AT+CGPS` commands.
//!
//! Session state is never trusted locally: every decision starts with an
//! `AT+CGPS?` query, because the receiver can be switched off behind our back
//! (modem reset, another tool on the port, a crash mid-session).

use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::{Error, ParseError};

const STATUS_QUERY: &str = "AT+CGPS?";
const START_COMMAND: &str = "AT+CGPS=1,1";
const STOP_COMMAND: &str = "AT+CGPS=0,1";
const FIX_QUERY: &str = "AT+CGPSINFO";

/// Receiver session as reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsSessionState {
    Stopped,
    Running,
}

/// A decoded `+CGPSINFO` report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsFix {
    /// Signed decimal degrees, south negative.
    pub latitude: f64,
    /// Signed decimal degrees, west negative.
    pub longitude: f64,
    /// UTC date, `YYYY-MM-DD`.
    pub date: String,
    /// UTC time, `HH:MM:SS`.
    pub time: String,
    /// Metres above MSL.
    pub altitude: Option<f64>,
    /// Speed over ground in knots.
    pub speed_knots: Option<f64>,
    /// Course over ground in degrees.
    pub course: Option<f64>,
}

/// What [`Gps::get_fix`] produced when it did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FixOutcome {
    Fix(GpsFix),
    /// Receiver running and answering, but no satellite lock.
    NoSignal,
}

/// Timing knobs for GPS exchanges.
#[derive(Debug, Clone, Copy)]
pub struct GpsTimeouts {
    /// `AT+CGPS?` reply deadline.
    pub status: Duration,
    /// Start/stop reply deadline.
    pub command: Duration,
    /// Wait after starting before re-checking the session.
    pub settle: Duration,
}

impl Default for GpsTimeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(3),
            command: Duration::from_secs(10),
            settle: Duration::from_secs(2),
        }
    }
}

/// GPS session manager. Holds a handle on the shared correlator.
pub struct Gps {
    modem: Correlator,
    timeouts: GpsTimeouts,
    last_seen: Mutex<Option<GpsSessionState>>,
}

impl Gps {
    #[must_use]
    pub fn new(modem: Correlator, timeouts: GpsTimeouts) -> Self {
        Self {
            modem,
            timeouts,
            last_seen: Mutex::new(None),
        }
    }

    /// The state reported by the most recent query, for display only.
    pub fn last_seen(&self) -> Option<GpsSessionState> {
        self.last_seen.lock().ok().and_then(|s| *s)
    }

    /// Ask the modem whether the receiver session is on.
    pub async fn state(&self) -> Result<GpsSessionState, Error> {
        let resp = self
            .modem
            .exchange(STATUS_QUERY, "OK", self.timeouts.status)
            .await?;
        let state = parse_cgps(&resp).ok_or_else(|| Error::Protocol {
            command: STATUS_QUERY.to_string(),
            response: resp.trim().to_string(),
        })?;
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Some(state);
        }
        debug!("GPS: session {state:?}");
        Ok(state)
    }

    /// Bring the session up. A no-op when it is already running.
    ///
    /// Otherwise the session is stopped first, which clears a receiver left
    /// half-open by an earlier crash, then started and re-checked after the
    /// settle delay.
    pub async fn start(&self) -> Result<(), Error> {
        if self.state().await? == GpsSessionState::Running {
            debug!("GPS: session already running");
            return Ok(());
        }

        info!("GPS: starting session");
        match self
            .modem
            .exchange(STOP_COMMAND, "OK", self.timeouts.command)
            .await
        {
            Ok(_) => {}
            Err(e @ Error::Transport(_)) => return Err(e),
            // ERROR here just means nothing was running
            Err(e) => debug!("GPS: pre-start stop: {e}"),
        }

        self.modem
            .exchange(START_COMMAND, "OK", self.timeouts.command)
            .await?;
        tokio::time::sleep(self.timeouts.settle).await;

        self.expect_state(GpsSessionState::Running).await?;
        info!("GPS: session started");
        Ok(())
    }

    /// Shut the session down and confirm the modem reports it stopped.
    pub async fn stop(&self) -> Result<(), Error> {
        info!("GPS: stopping session");
        match self
            .modem
            .exchange(STOP_COMMAND, "OK", self.timeouts.command)
            .await
        {
            Ok(_) => {}
            Err(e @ Error::Transport(_)) => return Err(e),
            Err(e) => warn!("GPS: stop command failed ({e}), re-checking"),
        }
        self.expect_state(GpsSessionState::Stopped).await?;
        info!("GPS: session stopped");
        Ok(())
    }

    async fn expect_state(&self, expected: GpsSessionState) -> Result<(), Error> {
        let actual = self.state().await?;
        if actual == expected {
            Ok(())
        } else {
            Err(Error::SessionState { expected, actual })
        }
    }

    /// Query a position, starting the session first if needed.
    ///
    /// Each failed query (timeout, modem error, unreadable payload) costs one
    /// attempt and restarts the session before the next one. A well-formed
    /// but empty report returns [`FixOutcome::NoSignal`] at once.
    pub async fn get_fix(&self, timeout: Duration, max_retries: u32) -> Result<FixOutcome, Error> {
        if self.state().await? != GpsSessionState::Running {
            info!("GPS: no active session, starting one before querying");
            self.start().await?;
        }

        for attempt in 1..=max_retries {
            let failure = match self.modem.exchange(FIX_QUERY, "OK", timeout).await {
                Ok(resp) => match parse_cgpsinfo(&resp) {
                    Ok(Some(fix)) => {
                        info!(
                            "GPS: fix {:.6},{:.6} on attempt {attempt}",
                            fix.latitude, fix.longitude
                        );
                        return Ok(FixOutcome::Fix(fix));
                    }
                    Ok(None) => {
                        info!("GPS: receiver active but no satellite lock");
                        return Ok(FixOutcome::NoSignal);
                    }
                    Err(e) => e.to_string(),
                },
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => e.to_string(),
            };

            warn!("GPS: fix attempt {attempt}/{max_retries} failed: {failure}");
            if attempt < max_retries {
                self.restart().await?;
            }
        }

        warn!("GPS: retry limit reached without a fix");
        Err(Error::FixUnavailable {
            attempts: max_retries,
        })
    }

    /// Stop and start again after a failed query. Only a lost link is
    /// reported; anything else is left for the next attempt to surface.
    async fn restart(&self) -> Result<(), Error> {
        match self.stop().await {
            Err(e @ Error::Transport(_)) => return Err(e),
            Err(e) => warn!("GPS: restart stop failed: {e}"),
            Ok(()) => {}
        }
        match self.start().await {
            Err(e @ Error::Transport(_)) => Err(e),
            Err(e) => {
                warn!("GPS: restart start failed: {e}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

/// `+CGPS: <on>,<mode>` → session state. `None` if the line is missing.
fn parse_cgps(response: &str) -> Option<GpsSessionState> {
    let line = response.lines().find(|l| l.contains("+CGPS:"))?;
    let on = line.split(':').nth(1)?.split(',').next()?.trim();
    Some(if on == "1" {
        GpsSessionState::Running
    } else {
        GpsSessionState::Stopped
    })
}

/// Parse an `AT+CGPSINFO` reply.
///
/// ```text
/// +CGPSINFO: <lat>,<N/S>,<lon>,<E/W>,<date>,<UTC time>,<alt>,<speed>,<course>
/// ```
///
/// `Ok(None)` when every field is empty (no lock yet).
fn parse_cgpsinfo(response: &str) -> Result<Option<GpsFix>, ParseError> {
    let line = response
        .lines()
        .find(|l| l.contains("+CGPSINFO:"))
        .ok_or(ParseError::MissingLine("+CGPSINFO"))?;

    let data = line.split_once(':').map_or("", |(_, rest)| rest.trim());
    let parts: Vec<&str> = data.split(',').map(str::trim).collect();

    if parts.iter().all(|p| p.is_empty()) {
        return Ok(None);
    }
    if parts.len() < 6 {
        return Err(ParseError::FieldCount {
            expected: 6,
            got: parts.len(),
        });
    }

    let date = NaiveDate::parse_from_str(parts[4], "%d%m%y")
        .map_err(|_| ParseError::Timestamp(parts[4].to_string()))?;
    let time = NaiveTime::parse_from_str(parts[5], "%H%M%S%.f")
        .map_err(|_| ParseError::Timestamp(parts[5].to_string()))?;

    let optional = |idx: usize| parts.get(idx).and_then(|s| s.parse::<f64>().ok());

    Ok(Some(GpsFix {
        latitude: parse_coordinate(parts[0], parts[1])?,
        longitude: parse_coordinate(parts[2], parts[3])?,
        date: date.format("%Y-%m-%d").to_string(),
        time: time.format("%H:%M:%S").to_string(),
        altitude: optional(6),
        speed_knots: optional(7),
        course: optional(8),
    }))
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere → signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str) -> Result<f64, ParseError> {
    let bad = || ParseError::Coordinate(format!("{value},{hemisphere}"));

    if !value.is_ascii() {
        return Err(bad());
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(bad());
    }
    let degrees: f64 = value[..dot - 2].parse().map_err(|_| bad())?;
    let minutes: f64 = value[dot - 2..].parse().map_err(|_| bad())?;
    if minutes >= 60.0 {
        return Err(bad());
    }
    let magnitude = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(magnitude),
        "S" | "W" => Ok(-magnitude),
        _ => Err(bad()),
    }
}
