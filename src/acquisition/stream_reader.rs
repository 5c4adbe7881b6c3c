//! Incremental JSON result stream reader
//!
//! The analytics engine writes its results as a never-ending run of JSON
//! objects, optionally wrapped in a single top-level array:
//!
//! ```text
//! {"bucket":...} {"quantileState":...} {"flush":"f1"}
//! [{"bucket":...},{"quantileState":...},{"flush":"f1"}
//! ```
//!
//! Objects are pulled one at a time straight off the channel. Only the bytes
//! of the next object are consumed, so a reader blocked on a live pipe never
//! waits for data beyond the object it is returning.

use std::io::{BufRead, BufReader, Read};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::StreamError;

/// Where the reader is in the top-level structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Nothing read yet
    Start,
    /// Whitespace-separated objects
    Bare,
    /// Inside `[`, expecting the first element or `]`
    ArrayStart,
    /// Inside `[`, expecting `,` or `]`
    ArrayAfterElement,
    /// Exhausted or failed; yields nothing further
    Done,
}

/// Lazy, forward-only sequence of top-level JSON objects
pub struct ResultStreamReader<R: Read> {
    reader: BufReader<R>,
    mode: Mode,
    objects_read: u64,
}

impl<R: Read> ResultStreamReader<R> {
    pub fn new(channel: R) -> Self {
        Self {
            reader: BufReader::new(channel),
            mode: Mode::Start,
            objects_read: 0,
        }
    }

    /// Number of objects returned so far
    pub const fn objects_read(&self) -> u64 {
        self.objects_read
    }

    /// Skip whitespace and peek the next byte without consuming it
    fn peek_non_whitespace(&mut self) -> Result<Option<u8>, StreamError> {
        loop {
            let (skipped, next) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Ok(None);
                }
                let skipped = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                (skipped, buf.get(skipped).copied())
            };
            self.reader.consume(skipped);
            if next.is_some() {
                return Ok(next);
            }
        }
    }

    fn read_object(&mut self) -> Result<Map<String, Value>, StreamError> {
        // No `end()` call: the deserializer must stop at the closing brace
        let mut de = serde_json::Deserializer::from_reader(self.reader.by_ref());
        let object = Map::<String, Value>::deserialize(&mut de)?;
        self.objects_read += 1;
        Ok(object)
    }

    fn unclosed_array_at_eof(&mut self) -> Option<Map<String, Value>> {
        warn!(
            objects = self.objects_read,
            "Result stream ended inside an unclosed array"
        );
        self.mode = Mode::Done;
        None
    }

    fn advance(&mut self) -> Result<Option<Map<String, Value>>, StreamError> {
        loop {
            match self.mode {
                Mode::Done => return Ok(None),

                Mode::Start => match self.peek_non_whitespace()? {
                    None => {
                        self.mode = Mode::Done;
                        return Ok(None);
                    }
                    Some(b'{') => self.mode = Mode::Bare,
                    Some(b'[') => {
                        self.reader.consume(1);
                        self.mode = Mode::ArrayStart;
                        debug!("Result stream is array-wrapped");
                    }
                    Some(other) => {
                        return Err(StreamError::Format(format!(
                            "should start with an array of objects or an object, found '{}'",
                            char::from(other)
                        )));
                    }
                },

                Mode::Bare => {
                    return match self.peek_non_whitespace()? {
                        None => {
                            self.mode = Mode::Done;
                            Ok(None)
                        }
                        Some(b'{') => self.read_object().map(Some),
                        Some(other) => Err(StreamError::Format(format!(
                            "expected an object, found '{}'",
                            char::from(other)
                        ))),
                    };
                }

                Mode::ArrayStart => {
                    return match self.peek_non_whitespace()? {
                        None => Ok(self.unclosed_array_at_eof()),
                        Some(b']') => {
                            self.reader.consume(1);
                            self.mode = Mode::Done;
                            Ok(None)
                        }
                        Some(b'{') => {
                            let object = self.read_object()?;
                            self.mode = Mode::ArrayAfterElement;
                            Ok(Some(object))
                        }
                        Some(other) => Err(StreamError::Format(format!(
                            "should start with an array of objects or an object, found array element '{}'",
                            char::from(other)
                        ))),
                    };
                }

                Mode::ArrayAfterElement => match self.peek_non_whitespace()? {
                    None => return Ok(self.unclosed_array_at_eof()),
                    Some(b']') => {
                        self.reader.consume(1);
                        self.mode = Mode::Done;
                        return Ok(None);
                    }
                    Some(b',') => {
                        self.reader.consume(1);
                        return match self.peek_non_whitespace()? {
                            None => Err(StreamError::Decode(
                                "result stream ended after ','".to_string(),
                            )),
                            Some(b'{') => self.read_object().map(Some),
                            Some(other) => Err(StreamError::Format(format!(
                                "expected an object after ',', found '{}'",
                                char::from(other)
                            ))),
                        };
                    }
                    Some(other) => {
                        return Err(StreamError::Format(format!(
                            "expected ',' or ']' between objects, found '{}'",
                            char::from(other)
                        )));
                    }
                },
            }
        }
    }
}

impl<R: Read> Iterator for ResultStreamReader<R> {
    type Item = Result<Map<String, Value>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(object)) => Some(Ok(object)),
            Ok(None) => {
                self.mode = Mode::Done;
                None
            }
            Err(e) => {
                self.mode = Mode::Done;
                Some(Err(e))
            }
        }
    }
}
