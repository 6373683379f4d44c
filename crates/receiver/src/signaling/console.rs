//! Copy/paste signaling over the terminal
//!
//! The offer goes to stdout between banners. Answers are read from stdin
//! one block at a time, each block ending with the end marker line (or EOF).
//! Logging goes to stderr, so stdout only ever carries what the user pastes
//! into the browser.

use super::controller::OfferPresenter;
use super::session::SessionHandle;
use crate::{Error, Result};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use tracing::{debug, info, warn};

pub const OFFER_BANNER: &str = "===== SDP OFFER (paste into browser) =====";
pub const END_MARKER: &str = "===== END SDP =====";

const ESCAPE: char = '\u{1b}';

/// Offer framed the way the browser page expects it
pub fn format_offer(sdp: &str) -> String {
    format!("\n{}\n{}\n{}\n\n", OFFER_BANNER, sdp, END_MARKER)
}

/// Exit keys understood by the render loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    Escape,
    Char(char),
}

impl KeyPress {
    /// A console line consisting of just an exit key
    pub fn from_line(line: &str) -> Option<Self> {
        match line.trim() {
            "q" => Some(KeyPress::Char('q')),
            "Q" => Some(KeyPress::Char('Q')),
            s if s.len() == 1 && s.starts_with(ESCAPE) => Some(KeyPress::Escape),
            _ => None,
        }
    }

    pub fn is_quit(&self) -> bool {
        matches!(self, KeyPress::Escape | KeyPress::Char('q') | KeyPress::Char('Q'))
    }
}

/// One unit of console input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    /// Lines of a pasted block, end marker excluded, joined with `\n`
    Answer(String),
    Key(KeyPress),
}

/// Splits a line stream into answer blocks and exit keys
pub struct ConsoleReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> ConsoleReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Next answer block or key; `None` at EOF with nothing pending
    ///
    /// Key lines only count between blocks. Blank lines between blocks are
    /// skipped; a block cut short by EOF is still returned.
    pub fn next_input(&mut self) -> io::Result<Option<ConsoleInput>> {
        let mut block: Vec<String> = Vec::new();

        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok((!block.is_empty()).then(|| ConsoleInput::Answer(block.join("\n"))));
            }

            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.contains(END_MARKER) {
                return Ok(Some(ConsoleInput::Answer(block.join("\n"))));
            }

            if block.is_empty() {
                if let Some(key) = KeyPress::from_line(line) {
                    return Ok(Some(ConsoleInput::Key(key)));
                }
                if line.trim().is_empty() {
                    continue;
                }
            }

            block.push(line.to_string());
        }
    }
}

/// Read a single answer block; `None` if the input ended before any line
pub fn read_answer<R: BufRead>(reader: R) -> io::Result<Option<String>> {
    let mut reader = ConsoleReader::new(reader);
    loop {
        match reader.next_input()? {
            Some(ConsoleInput::Answer(text)) => return Ok(Some(text)),
            Some(ConsoleInput::Key(key)) => debug!("Ignoring key {:?} while reading answer", key),
            None => return Ok(None),
        }
    }
}

/// Feed console input into the session and the render surface until EOF
/// or until both receivers are gone
pub fn pump_console<R: BufRead>(
    reader: R,
    session: &SessionHandle,
    keys: &mpsc::Sender<KeyPress>,
) -> io::Result<()> {
    let mut reader = ConsoleReader::new(reader);
    while let Some(input) = reader.next_input()? {
        match input {
            ConsoleInput::Answer(text) => {
                info!("Read answer from console ({} bytes)", text.len());
                if !session.answer(text) {
                    break;
                }
            }
            ConsoleInput::Key(key) => {
                if keys.send(key).is_err() {
                    debug!("Render surface gone, dropping key {:?}", key);
                }
            }
        }
    }
    Ok(())
}

/// [`OfferPresenter`] printing to stdout and reading answers from stdin
///
/// The blocking stdin reader is a plain thread started with the first
/// offer. It is never joined: at shutdown it is left sitting in `read`.
pub struct ConsolePresenter {
    session: SessionHandle,
    keys: mpsc::Sender<KeyPress>,
    reader_started: AtomicBool,
}

impl ConsolePresenter {
    pub fn new(session: SessionHandle, keys: mpsc::Sender<KeyPress>) -> Self {
        Self {
            session,
            keys,
            reader_started: AtomicBool::new(false),
        }
    }

    fn start_reader(&self) -> Result<()> {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = self.session.clone();
        let keys = self.keys.clone();
        std::thread::Builder::new()
            .name("console-reader".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                match pump_console(stdin.lock(), &session, &keys) {
                    Ok(()) => debug!("Console reader finished"),
                    Err(e) => warn!("Console reader failed: {}", e),
                }
            })
            .map_err(|e| Error::SignalingError(format!("failed to start console reader: {}", e)))?;
        Ok(())
    }
}

impl OfferPresenter for ConsolePresenter {
    fn present_offer(&self, sdp: &str) -> Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(format_offer(sdp).as_bytes())?;
        writeln!(
            out,
            "Paste the browser's answer below, then a line with {}",
            END_MARKER
        )?;
        out.flush()?;
        drop(out);

        self.start_reader()
    }

    fn answer_rejected(&self, reason: &str, will_retry: bool) {
        let mut out = io::stdout().lock();
        let result = if will_retry {
            writeln!(
                out,
                "\nAnswer rejected ({}). Paste it again, ending with {}",
                reason, END_MARKER
            )
        } else {
            writeln!(out, "\nAnswer rejected ({}). No attempts left.", reason)
        };
        if let Err(e) = result.and_then(|_| out.flush()) {
            warn!("Could not write to stdout: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::session::SessionMessage;
    use std::io::Cursor;

    #[test]
    fn test_format_offer() {
        let framed = format_offer("v=0\r\n");
        assert!(framed.starts_with("\n===== SDP OFFER (paste into browser) =====\n"));
        assert!(framed.ends_with("v=0\r\n\n===== END SDP =====\n\n"));
    }

    #[test]
    fn test_read_answer_until_marker() {
        let input = "v=0\no=- 1 1 IN IP4 0.0.0.0\n===== END SDP =====\nleftover\n";
        let answer = read_answer(Cursor::new(input)).unwrap().unwrap();
        assert_eq!(answer, "v=0\no=- 1 1 IN IP4 0.0.0.0");
    }

    #[test]
    fn test_marker_inside_longer_line() {
        let input = "v=0\n   ===== END SDP =====   \n";
        assert_eq!(read_answer(Cursor::new(input)).unwrap().unwrap(), "v=0");
    }

    #[test]
    fn test_read_answer_eof() {
        assert_eq!(read_answer(Cursor::new("")).unwrap(), None);
        assert_eq!(
            read_answer(Cursor::new("v=0\r\ns=-\r\n")).unwrap().unwrap(),
            "v=0\ns=-"
        );
    }

    #[test]
    fn test_keys_between_blocks() {
        let input = "q\n\nv=0\nq\n===== END SDP =====\n\u{1b}\n";
        let mut reader = ConsoleReader::new(Cursor::new(input));

        assert_eq!(
            reader.next_input().unwrap(),
            Some(ConsoleInput::Key(KeyPress::Char('q')))
        );
        // Inside a block a "q" line is just text
        assert_eq!(
            reader.next_input().unwrap(),
            Some(ConsoleInput::Answer("v=0\nq".to_string()))
        );
        assert_eq!(
            reader.next_input().unwrap(),
            Some(ConsoleInput::Key(KeyPress::Escape))
        );
        assert_eq!(reader.next_input().unwrap(), None);
    }

    #[test]
    fn test_quit_keys() {
        assert!(KeyPress::Escape.is_quit());
        assert!(KeyPress::Char('Q').is_quit());
        assert!(!KeyPress::Char('x').is_quit());
        assert_eq!(KeyPress::from_line("x"), None);
    }

    #[test]
    fn test_pump_console_routes_input() {
        let (session, mut rx) = SessionHandle::channel();
        let (keys_tx, keys_rx) = mpsc::channel();
        let input = "v=0\n===== END SDP =====\nQ\nv=0\ns=-\n";

        pump_console(Cursor::new(input), &session, &keys_tx).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Answer("v=0".to_string())
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionMessage::Answer("v=0\ns=-".to_string())
        );
        assert_eq!(keys_rx.try_recv().unwrap(), KeyPress::Char('Q'));
    }
}
