//! Client wire protocol
//!
//! Requests are length-prefixed arrays of bulk strings:
//! `*<count>\r\n` followed by `<count>` times `$<len>\r\n<bytes>\r\n`.
//! The first bulk string selects the command (`GET`, `SET`, `DEL`, case-sensitive).
//!
//! The decoder is a cursor over a borrowed buffer. It is not resumable mid-token:
//! on [`DecodeError::Incomplete`] the cursor rewinds to the start of the command and
//! the caller retries from there once more bytes have arrived.

use crate::common::command::{Command, MAX_FIELD_LEN};
use serde::{Deserialize, Serialize};

const CRLF: &[u8] = b"\r\n";
/// Largest bulk string accepted from a client. No stored field may exceed it.
pub const MAX_BULK_LEN: usize = MAX_FIELD_LEN;
/// Largest array accepted from a client.
pub const MAX_ARGS: usize = 1024 * 1024;
/// Longest decimal length prefix we bother parsing.
const MAX_NUMBER_DIGITS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended mid-token. Keep the bytes and retry once more arrive.
    Incomplete,
    /// Protocol violation. The connection should be dropped.
    Malformed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete => write!(f, "incomplete input"),
            DecodeError::Malformed(msg) => write!(f, "malformed input: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for crate::Error {
    fn from(e: DecodeError) -> Self {
        crate::Error::Protocol(e.to_string())
    }
}

fn malformed<T>(msg: impl Into<String>) -> Result<T, DecodeError> {
    Err(DecodeError::Malformed(msg.into()))
}

/// Cursor-based decoder over a byte buffer.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed by fully decoded commands.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Decode the next command. On error the cursor is left where the command started.
    pub fn next_command(&mut self) -> Result<Command, DecodeError> {
        let start = self.pos;
        let result = self.read_command().and_then(|cmd| match cmd.oversized_field() {
            // joined words can outgrow the per-bulk limit
            Some(len) => malformed(format!("{} field of {} bytes", cmd.name(), len)),
            None => Ok(cmd),
        });
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    /// Decode the next reply value (used by clients).
    pub fn next_reply(&mut self) -> Result<Reply, DecodeError> {
        let start = self.pos;
        let result = self.read_reply();
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_command(&mut self) -> Result<Command, DecodeError> {
        self.expect(b'*')?;
        let count = self.read_number()?;
        self.expect_crlf()?;

        if count == 0 {
            return malformed("empty command array");
        }
        if count > MAX_ARGS {
            return malformed(format!("too many arguments: {}", count));
        }

        let kind = self.read_bulk()?;
        match kind {
            b"GET" => {
                if count < 2 {
                    return malformed("GET needs a key");
                }
                let parts = self.read_args(count - 1)?;
                Ok(Command::Get {
                    key: utf8(join_words(&parts))?,
                })
            }
            b"SET" => {
                if count < 3 {
                    return malformed("SET needs a key and a value");
                }
                let key = utf8(self.read_bulk()?.to_vec())?;
                let parts = self.read_args(count - 2)?;
                Ok(Command::Set {
                    id: 0,
                    key,
                    value: join_words(&parts),
                })
            }
            b"DEL" => {
                if count < 2 {
                    return malformed("DEL needs at least one key");
                }
                let keys = self
                    .read_args(count - 1)?
                    .into_iter()
                    .map(|k| utf8(k.to_vec()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Command::Del { id: 0, keys })
            }
            other => malformed(format!(
                "unknown command '{}'",
                String::from_utf8_lossy(other)
            )),
        }
    }

    fn read_args(&mut self, n: usize) -> Result<Vec<&'a [u8]>, DecodeError> {
        let mut args = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            args.push(self.read_bulk()?);
        }
        Ok(args)
    }

    fn read_bulk(&mut self) -> Result<&'a [u8], DecodeError> {
        self.expect(b'$')?;
        let len = self.read_number()?;
        self.expect_crlf()?;
        if len > MAX_BULK_LEN {
            return malformed(format!("bulk string too long: {}", len));
        }

        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(DecodeError::Incomplete);
        }
        let data = &self.buf[self.pos..end];
        self.pos = end;
        self.expect_crlf()?;
        Ok(data)
    }

    fn read_reply(&mut self) -> Result<Reply, DecodeError> {
        let tag = self.peek()?;
        self.pos += 1;
        match tag {
            b'+' => Ok(Reply::Status(utf8(self.read_line()?.to_vec())?)),
            b'-' => Ok(Reply::Error(utf8(self.read_line()?.to_vec())?)),
            b':' => {
                let line = utf8(self.read_line()?.to_vec())?;
                line.parse::<i64>()
                    .map(Reply::Integer)
                    .or_else(|_| malformed(format!("bad integer '{}'", line)))
            }
            b'$' => {
                if self.peek()? == b'-' {
                    let line = self.read_line()?;
                    return if line == b"-1" {
                        Ok(Reply::Nil)
                    } else {
                        malformed("bad null bulk")
                    };
                }
                self.pos -= 1;
                Ok(Reply::Data(self.read_bulk()?.to_vec()))
            }
            b'*' => {
                let count = self.read_number()?;
                self.expect_crlf()?;
                if count > MAX_ARGS {
                    return malformed(format!("array too long: {}", count));
                }
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(self.read_reply()?);
                }
                Ok(Reply::Array(items))
            }
            other => malformed(format!("unexpected reply tag '{}'", other as char)),
        }
    }

    fn read_line(&mut self) -> Result<&'a [u8], DecodeError> {
        let rest = &self.buf[self.pos..];
        match rest.windows(2).position(|w| w == CRLF) {
            Some(idx) => {
                self.pos += idx + 2;
                Ok(&rest[..idx])
            }
            None => Err(DecodeError::Incomplete),
        }
    }

    fn read_number(&mut self) -> Result<usize, DecodeError> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_digit() {
            self.pos += 1;
            if self.pos - start > MAX_NUMBER_DIGITS {
                return malformed("length prefix too long");
            }
        }
        if self.pos == self.buf.len() {
            return Err(DecodeError::Incomplete);
        }
        if self.pos == start {
            return malformed("expected a decimal length");
        }

        let digits = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| DecodeError::Malformed("non-ascii length".into()))?;
        digits
            .parse::<usize>()
            .or_else(|_| malformed(format!("bad length '{}'", digits)))
    }

    fn expect_crlf(&mut self) -> Result<(), DecodeError> {
        self.expect(b'\r')?;
        self.expect(b'\n')
    }

    fn expect(&mut self, byte: u8) -> Result<(), DecodeError> {
        let got = self.peek()?;
        if got != byte {
            return malformed(format!(
                "expected '{}', got '{}'",
                byte.escape_ascii(),
                got.escape_ascii()
            ));
        }
        self.pos += 1;
        Ok(())
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::Incomplete)
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(bytes).or_else(|_| malformed("invalid UTF-8"))
}

/// Extra arguments are folded into the last field, separated by single spaces.
fn join_words(parts: &[&[u8]]) -> Vec<u8> {
    parts.join(&b' ')
}

/// Encode a command as a request array.
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    match cmd {
        Command::Get { key } => encode_args(&[b"GET", key.as_bytes()]),
        Command::Set { key, value, .. } => encode_args(&[b"SET", key.as_bytes(), value]),
        Command::Del { keys, .. } => {
            let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
            args.push(b"DEL");
            args.extend(keys.iter().map(|k| k.as_bytes()));
            encode_args(&args)
        }
    }
}

/// Encode raw arguments as a request array.
pub fn encode_args(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }
    out
}

/// A reply sent back to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// No data
    Nil,
    /// A number
    Integer(i64),
    /// Binary data
    Data(Vec<u8>),
    /// A simple error string
    Error(String),
    /// A simple status string
    Status(String),
    /// An array of replies
    Array(Vec<Reply>),
}

impl Reply {
    /// `+OK`
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// The error sentinel, `-ERROR`.
    pub fn error() -> Self {
        Reply::Error("ERROR".to_string())
    }

    /// GET result: the value's space-separated words, or `nil` when absent.
    pub fn from_value(value: Option<&[u8]>) -> Self {
        match value {
            Some(v) => Reply::Array(
                v.split(|b| *b == b' ')
                    .map(|word| Reply::Data(word.to_vec()))
                    .collect(),
            ),
            None => Reply::Array(vec![Reply::Data(b"nil".to_vec())]),
        }
    }

    /// Serialize the reply into wire bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Reply::Nil => b"$-1\r\n".to_vec(),
            Reply::Data(d) => {
                let mut out = format!("${}\r\n", d.len()).into_bytes();
                out.extend_from_slice(d);
                out.extend_from_slice(CRLF);
                out
            }
            Reply::Integer(i) => format!(":{}\r\n", i).into_bytes(),
            Reply::Error(e) => format!("-{}\r\n", e).into_bytes(),
            Reply::Status(s) => format!("+{}\r\n", s).into_bytes(),
            Reply::Array(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend(item.to_vec());
                }
                out
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(input: &[u8]) -> Result<Command, DecodeError> {
        Decoder::new(input).next_command()
    }

    #[test]
    fn test_decode_set_get_del() {
        let set = decode_one(b"*3\r\n$3\r\nSET\r\n$7\r\nCS06142\r\n$5\r\nCloud\r\n").unwrap();
        assert_eq!(set, Command::set("CS06142", "Cloud"));

        let get = decode_one(b"*2\r\n$3\r\nGET\r\n$7\r\nCS06142\r\n").unwrap();
        assert_eq!(get, Command::get("CS06142"));

        let del = decode_one(b"*3\r\n$3\r\nDEL\r\n$7\r\nCS06142\r\n$5\r\nCS162\r\n").unwrap();
        assert_eq!(del, Command::del(["CS06142", "CS162"]));
    }

    #[test]
    fn test_extra_args_are_joined() {
        let set = decode_one(
            b"*4\r\n$3\r\nSET\r\n$7\r\nCS06142\r\n$5\r\nCloud\r\n$9\r\nComputing\r\n",
        )
        .unwrap();
        assert_eq!(set, Command::set("CS06142", "Cloud Computing"));

        let get = decode_one(b"*3\r\n$3\r\nGET\r\n$2\r\nab\r\n$2\r\ncd\r\n").unwrap();
        assert_eq!(get, Command::get("ab cd"));
    }

    #[test]
    fn test_round_trip() {
        for cmd in [
            Command::get("k"),
            Command::set("key", "value with spaces"),
            Command::set("empty", ""),
            Command::del(["a", "b", "c"]),
        ] {
            let bytes = encode_command(&cmd);
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.next_command().unwrap(), cmd);
            assert!(decoder.is_done());
        }
    }

    #[test]
    fn test_incomplete_every_prefix() {
        let full = encode_command(&Command::set("CS06142", "Cloud Computing"));
        for cut in 0..full.len() {
            let mut decoder = Decoder::new(&full[..cut]);
            assert_eq!(
                decoder.next_command(),
                Err(DecodeError::Incomplete),
                "prefix of {} bytes",
                cut
            );
            assert_eq!(decoder.position(), 0);
        }
    }

    #[test]
    fn test_malformed() {
        let cases: &[&[u8]] = &[
            b"+OK\r\n",
            b"*x\r\n",
            b"*2\r\n$3\r\nPUT\r\n$1\r\nk\r\n",
            b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n",
            b"*1\r\n$3\r\nGET\r\n",
            b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n",
            b"*0\r\n",
            b"*2\r\n$3\r\nGET\r\n$1\r\nkk\r\n",
            b"*2\n$3\r\nGET\r\n",
        ];
        for case in cases {
            assert!(
                matches!(decode_one(case), Err(DecodeError::Malformed(_))),
                "{:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_field_length_limit() {
        // rejected from the header alone, before the payload arrives
        let header = format!("*3\r\n$3\r\nSET\r\n$1\r\nk\r\n${}\r\n", MAX_BULK_LEN + 1);
        assert!(matches!(
            decode_one(header.as_bytes()),
            Err(DecodeError::Malformed(_))
        ));

        let at_limit = encode_command(&Command::set("k", vec![b'v'; MAX_BULK_LEN]));
        assert!(decode_one(&at_limit).is_ok());

        // two words at the limit join into one value past it
        let half = vec![b'v'; MAX_BULK_LEN];
        let joined = encode_args(&[&b"SET"[..], &b"k"[..], &half[..], &half[..]]);
        assert!(matches!(decode_one(&joined), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_pipelined_commands() {
        let mut buf = encode_command(&Command::set("a", "1"));
        buf.extend(encode_command(&Command::get("a")));
        buf.extend_from_slice(b"*2\r\n$3\r\nDEL");

        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.next_command().unwrap(), Command::set("a", "1"));
        assert_eq!(decoder.next_command().unwrap(), Command::get("a"));
        let consumed = decoder.position();
        assert_eq!(decoder.next_command(), Err(DecodeError::Incomplete));
        assert_eq!(decoder.position(), consumed);
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(Reply::ok().to_vec(), b"+OK\r\n");
        assert_eq!(Reply::error().to_vec(), b"-ERROR\r\n");
        assert_eq!(Reply::Integer(1).to_vec(), b":1\r\n");
        assert_eq!(Reply::from_value(None).to_vec(), b"*1\r\n$3\r\nnil\r\n");
        assert_eq!(
            Reply::from_value(Some(b"Cloud Computing")).to_vec(),
            b"*2\r\n$5\r\nCloud\r\n$9\r\nComputing\r\n"
        );
    }

    #[test]
    fn test_reply_decoding() {
        for reply in [
            Reply::ok(),
            Reply::error(),
            Reply::Integer(-3),
            Reply::Nil,
            Reply::from_value(Some(b"a b")),
        ] {
            let bytes = reply.to_vec();
            assert_eq!(Decoder::new(&bytes).next_reply().unwrap(), reply);
            assert_eq!(
                Decoder::new(&bytes[..bytes.len() - 1]).next_reply(),
                Err(DecodeError::Incomplete)
            );
        }
    }
}
