//! In-memory SIM7600 stand-in for unit tests.
//!
//! Commands are decoded as they are written and the reply is queued for the
//! next `read_available`. Handles are cloneable so a test can keep one while
//! the correlator owns the other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::transport::Transport;

const CTRL_Z: u8 = 0x1A;
const ESC: u8 = 0x1B;

/// Scripted reply for one command occurrence.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Swallow the command; nothing is ever sent back.
    Silent,
}

#[derive(Default)]
struct SimState {
    pending: VecDeque<u8>,
    written: Vec<u8>,
    commands: Vec<String>,
    line: Vec<u8>,
    echo: bool,
    gps_on: bool,
    /// Payload after `+CGPSINFO: `.
    fix: String,
    listing: String,
    scripts: HashMap<String, VecDeque<Reply>>,
    /// Appended after the next reply, simulating late unsolicited bytes.
    trailing: Option<String>,
    prompt_open: bool,
    prompt_seen: bool,
    body: Vec<u8>,
    body_before_prompt: bool,
    sent_bodies: Vec<Vec<u8>>,
    cmgs_reply: Option<String>,
    /// The LF of a CRLF terminator is not part of an SMS body.
    skip_lf: bool,
}

#[derive(Clone, Default)]
pub struct SimModem {
    state: Arc<Mutex<SimState>>,
}

impl SimModem {
    pub fn new() -> Self {
        let sim = Self::default();
        sim.set_fix(",,,,,,,,");
        sim
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_echo(&self, on: bool) {
        self.with(|s| s.echo = on);
    }

    pub fn set_gps(&self, on: bool) {
        self.with(|s| s.gps_on = on);
    }

    pub fn gps_on(&self) -> bool {
        self.with(|s| s.gps_on)
    }

    pub fn set_fix(&self, payload: &str) {
        self.with(|s| s.fix = payload.to_string());
    }

    pub fn set_listing(&self, listing: &str) {
        self.with(|s| s.listing = listing.to_string());
    }

    pub fn set_trailing(&self, bytes: &str) {
        self.with(|s| s.trailing = Some(bytes.to_string()));
    }

    /// Final reply after the Ctrl-Z of an `AT+CMGS` body.
    pub fn set_send_reply(&self, reply: &str) {
        self.with(|s| s.cmgs_reply = Some(reply.to_string()));
    }

    /// Queue replies for `command`, consumed one per occurrence before the
    /// built-in behaviour applies again.
    pub fn script(&self, command: &str, replies: Vec<Reply>) {
        self.with(|s| {
            s.scripts
                .entry(command.to_string())
                .or_default()
                .extend(replies);
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.commands.clone())
    }

    pub fn count(&self, command: &str) -> usize {
        self.with(|s| s.commands.iter().filter(|c| *c == command).count())
    }

    pub fn written(&self) -> Vec<u8> {
        self.with(|s| s.written.clone())
    }

    pub fn sent_bodies(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.sent_bodies.clone())
    }

    pub fn body_before_prompt(&self) -> bool {
        self.with(|s| s.body_before_prompt)
    }
}

impl SimState {
    fn queue(&mut self, text: &str) {
        self.pending.extend(text.as_bytes());
        if let Some(extra) = self.trailing.take() {
            self.pending.extend(extra.as_bytes());
        }
    }

    fn feed(&mut self, byte: u8) {
        if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
            return;
        }
        if byte == ESC {
            self.prompt_open = false;
            self.prompt_seen = false;
            self.body.clear();
            self.line.clear();
            return;
        }
        if self.prompt_open {
            if !self.prompt_seen {
                self.body_before_prompt = true;
            }
            if byte == CTRL_Z {
                self.prompt_open = false;
                self.prompt_seen = false;
                self.sent_bodies.push(std::mem::take(&mut self.body));
                let reply = self
                    .cmgs_reply
                    .clone()
                    .unwrap_or_else(|| "\r\n+CMGS: 12\r\n\r\nOK\r\n".to_string());
                self.queue(&reply);
            } else {
                self.body.push(byte);
                if self.echo {
                    self.pending.push_back(byte);
                }
            }
            return;
        }

        match byte {
            b'\r' => {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                if !line.is_empty() {
                    self.dispatch(&line);
                    self.skip_lf = true;
                }
            }
            b'\n' => {}
            other => self.line.push(other),
        }
    }

    fn dispatch(&mut self, command: &str) {
        self.commands.push(command.to_string());
        if self.echo {
            self.pending.extend(format!("{command}\r").as_bytes());
        }

        if let Some(reply) = self.scripts.get_mut(command).and_then(VecDeque::pop_front) {
            match reply {
                Reply::Text(text) => self.queue(&text),
                Reply::Silent => {}
            }
            return;
        }

        let reply = match command {
            "AT" => "\r\nOK\r\n".to_string(),
            "ATE0" => {
                self.echo = false;
                "\r\nOK\r\n".to_string()
            }
            "AT+CGPS?" => format!("\r\n+CGPS: {},1\r\n\r\nOK\r\n", u8::from(self.gps_on)),
            "AT+CGPS=1,1" => {
                if self.gps_on {
                    "\r\nERROR\r\n".to_string()
                } else {
                    self.gps_on = true;
                    "\r\nOK\r\n".to_string()
                }
            }
            "AT+CGPS=0,1" => {
                if self.gps_on {
                    self.gps_on = false;
                    "\r\nOK\r\n\r\n+CGPS: 0\r\n".to_string()
                } else {
                    "\r\nERROR\r\n".to_string()
                }
            }
            "AT+CGPSINFO" => format!("\r\n+CGPSINFO: {}\r\n\r\nOK\r\n", self.fix),
            "AT+CPIN?" => "\r\n+CPIN: READY\r\n\r\nOK\r\n".to_string(),
            "AT+CSQ" => "\r\n+CSQ: 20,99\r\n\r\nOK\r\n".to_string(),
            _ if command.starts_with("AT+CMGL=") => {
                if self.listing.is_empty() {
                    "\r\nOK\r\n".to_string()
                } else {
                    self.listing.clone()
                }
            }
            _ if command.starts_with("AT+CMGS=") => {
                self.prompt_open = true;
                "\r\n> ".to_string()
            }
            _ if command.starts_with("AT+CMGD=") => "\r\nOK\r\n".to_string(),
            _ if command.starts_with("AT+CPMS=")
                || command.starts_with("AT+CMGF=")
                || command.starts_with("AT+CSCS=")
                || command.starts_with("AT+CMEE=") =>
            {
                "\r\nOK\r\n".to_string()
            }
            _ => "\r\nERROR\r\n".to_string(),
        };
        self.queue(&reply);
    }
}

impl Transport for SimModem {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.with(|s| {
            s.written.extend_from_slice(bytes);
            for &b in bytes {
                s.feed(b);
            }
        });
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        Ok(self.with(|s| {
            let out: Vec<u8> = s.pending.drain(..).collect();
            if s.prompt_open && out.contains(&b'>') {
                s.prompt_seen = true;
            }
            out
        }))
    }

    fn clear(&mut self) -> Result<(), Error> {
        self.with(|s| s.pending.clear());
        Ok(())
    }
}
