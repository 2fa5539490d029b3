//! Record scanner for stderr-format logs
//!
//! PostgreSQL stderr logs spill a single statement over multiple physical
//! lines, marking trailing lines with a leading tab:
//!
//! ```text
//! 2018-05-03|gc|LOG:  duration: 0.096 ms  parse <unnamed>:
//!     DELETE FROM que_jobs
//!     WHERE queue    = $1::text
//! ```
//!
//! The scanner reassembles those into one logical record per statement: a
//! newline terminates a record only when the byte that follows it is not a
//! tab, and each `\n\t` pair folds to a single `\n` in the emitted record.

use std::io::Read;

use crate::error::{PlaybackError, Result};

use super::MAX_LOG_RECORD_SIZE;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Streaming scanner producing one logical record per call to [`scan`].
///
/// [`scan`]: LogScanner::scan
pub struct LogScanner<R> {
    input: R,
    buffer: Vec<u8>,
    // Prefix of `buffer` already known not to contain a record terminator.
    scanned: usize,
    eof: bool,
    max_record_size: usize,
}

impl<R: Read> LogScanner<R> {
    pub fn new(input: R) -> Self {
        Self::with_max_record_size(input, MAX_LOG_RECORD_SIZE)
    }

    pub fn with_max_record_size(input: R, max_record_size: usize) -> Self {
        Self {
            input,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            scanned: 0,
            eof: false,
            max_record_size,
        }
    }

    /// Produce the next logical record, or `None` at end of input.
    ///
    /// Fails if the input cannot be read or a single record grows past the
    /// configured maximum size.
    pub fn scan(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(record) = self.take_record() {
                return Ok(Some(record));
            }

            if self.eof {
                // Whatever is left is the final record, unless it trims to
                // nothing.
                let tail = finalize(&self.buffer);
                self.buffer.clear();
                self.scanned = 0;
                return Ok((!tail.is_empty()).then_some(tail));
            }

            if self.buffer.len() >= self.max_record_size {
                return Err(PlaybackError::RecordTooLarge {
                    limit: self.max_record_size,
                });
            }

            self.fill()?;
        }
    }

    /// Try to split one record off the front of the buffer.
    fn take_record(&mut self) -> Option<String> {
        // Only seek to the penultimate byte: a newline can only be judged a
        // terminator by peeking at the byte after it, and that byte may not
        // have been read yet.
        while self.buffer.len() >= 2 && self.scanned < self.buffer.len() - 1 {
            let window = &self.buffer[self.scanned..self.buffer.len() - 1];
            let Some(offset) = window.iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len() - 1;
                return None;
            };

            // One past the newline; always a valid index given the window.
            let end = self.scanned + offset + 1;
            self.scanned = end;

            // Not a terminator if a continuation follows, and don't emit
            // records that are nothing but whitespace (blank leading lines
            // get absorbed into the next record and trimmed away).
            if self.buffer[end] != b'\t' && !self.buffer[..end].trim_ascii().is_empty() {
                let record = finalize(&self.buffer[..end]);
                self.buffer.drain(..end);
                self.scanned = 0;
                return Some(record);
            }
        }

        None
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = self.input.read(&mut chunk)?;
        if read == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }
}

/// Fold `\n\t` continuation markers into plain `\n` and trim the record.
fn finalize(raw: &[u8]) -> String {
    let mut folded = Vec::with_capacity(raw.len());
    let mut idx = 0;
    while idx < raw.len() {
        if raw[idx] == b'\n' && raw.get(idx + 1) == Some(&b'\t') {
            folded.push(b'\n');
            idx += 2;
        } else {
            folded.push(raw[idx]);
            idx += 1;
        }
    }
    String::from_utf8_lossy(folded.trim_ascii()).into_owned()
}
