//! Command/response correlation over a single serial link.
//!
//! Every exchange goes through one `tokio::sync::Mutex` around the transport,
//! so GPS, SMS and status callers never interleave bytes. An exchange clears
//! stale input, writes the command with CRLF, then polls the link at a fixed
//! interval until the expected substring shows up, a final error line shows
//! up, or the deadline passes. Input is cleared again on every outcome.
//!
//! Background polling uses a FIFO of [`PendingCommand`]s drained by one task
//! (see [`Correlator::spawn_poller`]). The task takes the same lock per
//! exchange and releases it between entries, so one-shot callers are never
//! starved by repeating polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::transport::Transport;
use crate::util::truncate_for_log;

/// Default interval between reads of the link.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for the echo-disable handshake in [`Correlator::init`].
const INIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts each record of an SMS listing; free text follows it.
const LISTING_HEADER: &str = "+CMGL:";

/// A queued command for the background poller.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: String,
    pub expected: String,
    pub timeout: Duration,
    repeat: bool,
    cancelled: Arc<AtomicBool>,
}

impl PendingCommand {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn repeats(&self) -> bool {
        self.repeat && !self.is_cancelled()
    }
}

/// Owner's handle on a scheduled command.
#[derive(Debug, Clone)]
pub struct PollHandle {
    command: String,
    repeat: bool,
    cancelled: Arc<AtomicBool>,
}

impl PollHandle {
    /// Stop re-enqueuing and drop the entry if it is still queued. An
    /// execution already in progress still completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        debug!("Poll `{}`: cancelled", self.command);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_repeating(&self) -> bool {
        self.repeat && !self.is_cancelled()
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Result of one background exchange, published to subscribers.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub command: String,
    pub result: Result<String, Error>,
}

/// Cloneable handle to the single exclusion gate in front of the modem.
#[derive(Clone)]
pub struct Correlator {
    link: Arc<Mutex<Box<dyn Transport>>>,
    poll_interval: Duration,
    queue_tx: mpsc::UnboundedSender<PendingCommand>,
    queue_rx: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<PendingCommand>>>>,
    outcomes: broadcast::Sender<PollOutcome>,
}

impl Correlator {
    /// Take ownership of `transport`. The link is closed when the last handle
    /// (and the poller, if spawned) is dropped.
    pub fn new(transport: impl Transport + 'static, poll_interval: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(64);
        Self {
            link: Arc::new(Mutex::new(Box::new(transport))),
            poll_interval,
            queue_tx,
            queue_rx: Arc::new(std::sync::Mutex::new(Some(queue_rx))),
            outcomes,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Hold the gate for a multi-step exchange (e.g. the SMS prompt
    /// handshake). Other callers wait until the guard is dropped.
    pub async fn lock(&self) -> LinkGuard<'_> {
        LinkGuard {
            link: self.link.lock().await,
            poll_interval: self.poll_interval,
        }
    }

    /// Send `command` and wait up to `timeout` for `expected` in the reply.
    ///
    /// Returns the full accumulated reply on success.
    pub async fn exchange(
        &self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.lock().await.exchange(command, expected, timeout).await
    }

    /// Abort any partial command left in the modem and disable echo.
    ///
    /// Failures are logged; the echo-tolerant matching in
    /// [`LinkGuard::exchange`] keeps working with echo on.
    pub async fn init(&self) -> Result<(), Error> {
        let mut link = self.lock().await;
        link.write_raw(b"\r")?;
        tokio::time::sleep(self.poll_interval).await;
        link.clear()?;

        match link.exchange("ATE0", "OK", INIT_TIMEOUT).await {
            Ok(_) => info!("Modem: echo disabled"),
            Err(Error::Transport(e)) => return Err(Error::Transport(e)),
            Err(e) => warn!("Modem: ATE0 failed ({e}), continuing with echo"),
        }
        Ok(())
    }

    /// Enqueue a command for the background poller.
    ///
    /// With `repeat`, the poller re-enqueues the command one poll interval
    /// after each execution until [`PollHandle::cancel`] is called.
    pub fn schedule(
        &self,
        command: &str,
        expected: &str,
        timeout: Duration,
        repeat: bool,
    ) -> PollHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let pending = PendingCommand {
            command: command.to_string(),
            expected: expected.to_string(),
            timeout,
            repeat,
            cancelled: cancelled.clone(),
        };
        if self.queue_tx.send(pending).is_err() {
            warn!("Poll `{command}`: queue closed, not scheduled");
        }
        PollHandle {
            command: command.to_string(),
            repeat,
            cancelled,
        }
    }

    /// Receive every background outcome from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PollOutcome> {
        self.outcomes.subscribe()
    }

    /// Spawn the single task that drains the poll queue. Abort the returned
    /// handle on shutdown. Fails if a poller was already spawned.
    pub fn spawn_poller(&self) -> Result<tokio::task::JoinHandle<()>, Error> {
        let rx = self
            .queue_rx
            .lock()
            .map_err(|_| Error::Queue("lock poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Queue("poller already running".into()))?;

        let this = self.clone();
        Ok(tokio::spawn(async move { this.run_queue(rx).await }))
    }

    async fn run_queue(self, mut rx: mpsc::UnboundedReceiver<PendingCommand>) {
        while let Some(pending) = rx.recv().await {
            if pending.is_cancelled() {
                debug!("Poll `{}`: cancelled while queued, skipped", pending.command);
                continue;
            }

            let result = self
                .exchange(&pending.command, &pending.expected, pending.timeout)
                .await;

            let link_lost = matches!(result, Err(Error::Transport(_)));
            match &result {
                Ok(resp) => debug!(
                    "Poll `{}`: {:?}",
                    pending.command,
                    truncate_for_log(resp.trim(), 80)
                ),
                Err(e) if link_lost => {
                    error!("Poll `{}`: link failed ({e}), poller stopping", pending.command);
                }
                Err(e) => warn!("Poll `{}` failed: {e}", pending.command),
            }

            let _ = self.outcomes.send(PollOutcome {
                command: pending.command.clone(),
                result,
            });
            if link_lost {
                return;
            }

            if pending.repeats() {
                tokio::time::sleep(self.poll_interval).await;
                if pending.repeats() && self.queue_tx.send(pending).is_err() {
                    break;
                }
            }
        }
        debug!("Poller exiting");
    }
}

/// Exclusive access to the link, obtained from [`Correlator::lock`].
pub struct LinkGuard<'a> {
    link: MutexGuard<'a, Box<dyn Transport>>,
    poll_interval: Duration,
}

impl LinkGuard<'_> {
    /// Clear, write `command` + CRLF, and collect until `expected`.
    pub async fn exchange(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.link.clear()?;
        self.link.write(format!("{command}\r\n").as_bytes())?;
        self.collect(command, Some(command), expected, timeout).await
    }

    /// Write bytes as-is, without terminator and without clearing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.link.write(bytes)
    }

    /// Wait for `expected` without writing anything first. `label` names the
    /// step in errors and logs. A leading `echo` of bytes written earlier
    /// (e.g. an SMS body) is skipped before matching.
    pub async fn wait_for(
        &mut self,
        label: &str,
        echo: Option<&str>,
        expected: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.collect(label, echo, expected, timeout).await
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        self.link.clear()
    }

    async fn collect(
        &mut self,
        command: &str,
        echo: Option<&str>,
        expected: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let start = Instant::now();
        let mut acc = String::with_capacity(256);

        loop {
            let bytes = self.link.read_available()?;
            if !bytes.is_empty() {
                acc.push_str(&sanitize_response(&String::from_utf8_lossy(&bytes)));
            }

            let reply = echo.map_or(acc.as_str(), |echo| after_echo(&acc, echo));

            match classify(reply, expected) {
                Verdict::Matched => {
                    self.link.clear()?;
                    return Ok(acc);
                }
                Verdict::Rejected => {
                    self.link.clear()?;
                    return Err(Error::Protocol {
                        command: command.to_string(),
                        response: acc.trim().to_string(),
                    });
                }
                Verdict::Pending => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.link.clear()?;
                debug!(
                    "`{command}` timed out, partial: {:?}",
                    truncate_for_log(acc.trim(), 80)
                );
                return Err(Error::Timeout {
                    command: command.to_string(),
                    elapsed,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Matched,
    /// A final error line came before the expected text.
    Rejected,
    Pending,
}

fn classify(reply: &str, expected: &str) -> Verdict {
    let hit = reply.find(expected);
    let err = error_line_offset(reply);
    match (hit, err) {
        (Some(h), Some(e)) if e < h => Verdict::Rejected,
        (Some(_), _) => Verdict::Matched,
        (None, Some(_)) => Verdict::Rejected,
        (None, None) => Verdict::Pending,
    }
}

/// Byte offset of a final-error line (`ERROR`, `+CME ERROR: n`,
/// `+CMS ERROR: n`).
///
/// A final result code is the last line of a reply: an error line counts only
/// when it is complete and nothing but whitespace follows it. After a
/// `+CMGL:` header the reply carries free-text message bodies, so no line
/// there is taken as a final error.
fn error_line_offset(response: &str) -> Option<usize> {
    let mut offset = 0;
    for line in response.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with(LISTING_HEADER) {
            return None;
        }
        let rest = &response[offset + line.len()..];
        if line.ends_with('\n') && is_error_line(trimmed) && rest.trim().is_empty() {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

fn is_error_line(line: &str) -> bool {
    line == "ERROR" || line.starts_with("+CME ERROR:") || line.starts_with("+CMS ERROR:")
}

/// The part of `acc` after the echoed command line, if the modem echoed it.
fn after_echo<'a>(acc: &'a str, command: &str) -> &'a str {
    let trimmed = acc.trim_start();
    if !command.is_empty() && trimmed.starts_with(command) {
        &trimmed[command.len()..]
    } else {
        acc
    }
}

/// Remove NUL bytes and non-printable control characters (except CR/LF) from
/// the modem response. Stale buffer data can contain garbage bytes that break
/// line-based parsing.
fn sanitize_response(response: &str) -> String {
    response
        .chars()
        .filter(|&c| c == '\r' || c == '\n' || !c.is_control())
        .filter(|&c| c != '\u{FFFD}')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Reply, SimModem};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn correlator(sim: &SimModem) -> Correlator {
        Correlator::new(sim.clone(), DEFAULT_POLL_INTERVAL)
    }

    #[test]
    fn test_classify_ok() {
        assert_eq!(classify("\r\n+CSQ: 15,99\r\n\r\nOK\r\n", "OK"), Verdict::Matched);
    }

    #[test]
    fn test_classify_partial() {
        assert_eq!(classify("\r\n+CSQ: 15,99\r\n", "OK"), Verdict::Pending);
    }

    #[test]
    fn test_classify_cme_error() {
        assert_eq!(classify("\r\n+CME ERROR: 516\r\n", "OK"), Verdict::Rejected);
    }

    #[test]
    fn test_classify_error_line_must_be_complete() {
        // "ERROR" mid-line is not a final result code
        assert_eq!(classify("\r\n+CMGL: 1,\"REC READ\"\r\nERROR at noon", "\r\nOK\r\n"), Verdict::Pending);
    }

    #[test]
    fn test_classify_expected_before_error() {
        assert_eq!(classify("\r\n> \r\nERROR\r\n", ">"), Verdict::Matched);
    }

    #[test]
    fn test_classify_error_must_be_last_line() {
        assert_eq!(classify("\r\nERROR\r\nmore\r\n", "OK"), Verdict::Pending);
        assert_eq!(classify("\r\nERROR\r\n\r\n", "OK"), Verdict::Rejected);
    }

    #[test]
    fn test_classify_error_body_in_listing() {
        let partial = "\r\n+CMGL: 1,\"REC READ\",\"+1555\",\"\",\"24/01/15,10:30:00+32\"\r\nERROR\r\n";
        assert_eq!(classify(partial, "\r\nOK\r\n"), Verdict::Pending);
        let complete = format!("{partial}+CMGL: 2,\"REC READ\",\"+1555\",\"\",\"24/01/15,10:31:00+32\"\r\n+CMS ERROR: 500\r\n\r\nOK\r\n");
        assert_eq!(classify(&complete, "\r\nOK\r\n"), Verdict::Matched);
    }

    #[test]
    fn test_after_echo_strips_command() {
        assert_eq!(after_echo("AT+CGPS?\r\r\n+CGPS: 1,1\r\n", "AT+CGPS?"), "\r\r\n+CGPS: 1,1\r\n");
        assert_eq!(after_echo("\r\n+CGPS: 1,1\r\n", "AT+CGPS?"), "\r\n+CGPS: 1,1\r\n");
    }

    #[test]
    fn test_sanitize_response_removes_nul() {
        let cleaned = sanitize_response("\x00\r\n+CSQ: 15,99\r\nOK\r\n");
        assert!(!cleaned.contains('\x00'));
        assert!(cleaned.contains("+CSQ: 15,99"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_returns_reply_with_expected() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let resp = corr.exchange("AT+CSQ", "OK", TIMEOUT).await.unwrap();
        assert!(resp.contains("+CSQ: 20,99"));
        assert!(resp.contains("OK"));
        assert_eq!(sim.written(), b"AT+CSQ\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_exchanges_do_not_mix() {
        let sim = SimModem::new();
        sim.set_trailing("\r\n+CSQ: 31,99\r\nRING\r\n");
        let corr = correlator(&sim);

        let first = corr.exchange("AT+CSQ", "+CSQ:", TIMEOUT).await.unwrap();
        assert!(first.contains("+CSQ:"));

        let second = corr.exchange("AT+CPIN?", "READY", TIMEOUT).await.unwrap();
        assert!(second.contains("READY"));
        assert!(!second.contains("+CSQ"));
        assert!(!second.contains("RING"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_does_not_satisfy_expected() {
        let sim = SimModem::new();
        sim.set_echo(true);
        sim.script("AT+CGPS?", vec![Reply::Silent]);
        let corr = correlator(&sim);

        // The echoed "AT+CGPS?" contains "+CGPS" but is not a reply.
        let err = corr.exchange("AT+CGPS?", "+CGPS", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds() {
        let sim = SimModem::new();
        sim.script("AT+CSQ", vec![Reply::Silent]);
        let corr = correlator(&sim);
        let timeout = Duration::from_millis(750);

        let started = Instant::now();
        let err = corr.exchange("AT+CSQ", "OK", timeout).await.unwrap_err();
        let waited = started.elapsed();

        assert!(waited >= timeout, "returned early: {waited:?}");
        assert!(waited <= timeout + DEFAULT_POLL_INTERVAL, "overran: {waited:?}");
        match err {
            Error::Timeout { command, elapsed } => {
                assert_eq!(command, "AT+CSQ");
                assert!(elapsed >= timeout);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_fails_fast() {
        let sim = SimModem::new();
        let corr = correlator(&sim);

        let started = Instant::now();
        let err = corr
            .exchange("AT+BOGUS", "OK", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, Error::Protocol { ref command, .. } if command == "AT+BOGUS"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_disables_echo() {
        let sim = SimModem::new();
        sim.set_echo(true);
        let corr = correlator(&sim);
        corr.init().await.unwrap();
        assert_eq!(sim.commands(), vec!["ATE0".to_string()]);
        let resp = corr.exchange("AT", "OK", TIMEOUT).await.unwrap();
        assert!(!resp.contains("AT\r"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_poll_runs_once() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let mut outcomes = corr.subscribe();
        let handle = corr.schedule("AT+CSQ", "OK", TIMEOUT, false);
        let poller = corr.spawn_poller().unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.command, "AT+CSQ");
        assert!(outcome.result.unwrap().contains("+CSQ:"));
        assert!(!handle.is_repeating());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sim.count("AT+CSQ"), 1);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_poll_until_cancelled() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let mut outcomes = corr.subscribe();
        let handle = corr.schedule("AT+CSQ", "OK", TIMEOUT, true);
        let poller = corr.spawn_poller().unwrap();

        for _ in 0..3 {
            let outcome = outcomes.recv().await.unwrap();
            assert!(outcome.result.is_ok());
        }
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let after_cancel = sim.count("AT+CSQ");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sim.count("AT+CSQ"), after_cancel);
        assert!(after_cancel <= 4);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_queued_entry_is_skipped() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let mut outcomes = corr.subscribe();
        let dropped = corr.schedule("AT+CSQ", "OK", TIMEOUT, false);
        corr.schedule("AT+CPIN?", "READY", TIMEOUT, false);
        dropped.cancel();
        assert!(dropped.is_cancelled());
        let poller = corr.spawn_poller().unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.command, "AT+CPIN?");
        assert_eq!(sim.count("AT+CSQ"), 0);
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_exchange_between_polls() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let mut outcomes = corr.subscribe();
        let handle = corr.schedule("AT+CSQ", "OK", TIMEOUT, true);
        let poller = corr.spawn_poller().unwrap();

        outcomes.recv().await.unwrap();
        let resp = corr.exchange("AT+CPIN?", "READY", TIMEOUT).await.unwrap();
        assert!(!resp.contains("+CSQ"));
        assert_eq!(sim.count("AT+CPIN?"), 1);

        handle.cancel();
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_poller_rejected() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let poller = corr.spawn_poller().unwrap();
        assert!(corr.spawn_poller().is_err());
        poller.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_wait_for_without_write() {
        let sim = SimModem::new();
        let corr = correlator(&sim);
        let mut link = corr.lock().await;
        let err = link
            .wait_for("idle", None, "OK", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref command, .. } if command == "idle"));
        assert!(sim.written().is_empty());
    }
}
