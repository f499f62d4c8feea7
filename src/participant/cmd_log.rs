//! Side log of prepared command bodies
//!
//! The record log only stores `(status, id, next_id)`. To rebuild a prepared
//! request after a crash the participant also persists the full command here
//! before it votes.
//!
//! Entry format: [MAGIC:4][TAG:1][ID:4 LE][COUNT:4 LE]{[LEN:4 LE][BYTES]}*COUNT[CRC32:4 LE]
//! The CRC covers TAG through the last field.

use crate::common::wal::LogWriter;
use crate::common::{crc32, Command, Error, Result, WalSyncPolicy};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

const CMD_MAGIC: [u8; 4] = [0x43, 0x4D, 0x44, 0x31]; // "CMD1"
const TAG_SET: u8 = 1;
const TAG_DEL: u8 = 2;

pub struct CommandLog {
    writer: LogWriter,
}

impl CommandLog {
    /// Open or create the log and return every intact entry, keyed by id.
    /// A later entry for the same id replaces an earlier one.
    pub fn open(
        path: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
    ) -> Result<(Self, BTreeMap<u32, Command>)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut commands = BTreeMap::new();
        let mut pos = 0usize;
        while pos < data.len() {
            match decode_entry(&data[pos..]) {
                Ok((cmd, used)) => {
                    if let Some(id) = cmd.id() {
                        commands.insert(id, cmd);
                    }
                    pos += used;
                }
                Err(e) => {
                    tracing::warn!(
                        "Command log {:?}: dropping {} bytes from offset {}: {}",
                        path,
                        data.len() - pos,
                        pos,
                        e
                    );
                    file.set_len(pos as u64)?;
                    break;
                }
            }
        }

        Ok((
            Self {
                writer: LogWriter::new(path, file, sync_policy),
            },
            commands,
        ))
    }

    /// Append a prepared command. Must be durable before the participant votes.
    pub fn append(&mut self, cmd: &Command) -> Result<()> {
        let entry = encode_entry(cmd)?;
        self.writer.append(&entry)
    }

    /// True once an append has failed. The log refuses further entries.
    pub fn is_failed(&self) -> bool {
        self.writer.is_failed()
    }

    /// Rewrite the log so it only holds `live`. Used after recovery, once the
    /// record log has said which ids still matter.
    pub fn compact(&mut self, live: &BTreeMap<u32, Command>) -> Result<()> {
        let path = self.writer.path().to_path_buf();
        let tmp_path = path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for cmd in live.values() {
                tmp.write_all(&encode_entry(cmd)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        self.writer.reopen(file);
        tracing::debug!("Compacted {:?} to {} entries", path, live.len());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_writes(&mut self) {
        if let Err(e) = self.writer.redirect("/dev/full") {
            panic!("cannot open /dev/full: {}", e);
        }
    }
}

fn encode_entry(cmd: &Command) -> Result<Vec<u8>> {
    let (tag, id, fields): (u8, u32, Vec<&[u8]>) = match cmd {
        Command::Set { id, key, value } => (TAG_SET, *id, vec![key.as_bytes(), value.as_slice()]),
        Command::Del { id, keys } => (TAG_DEL, *id, keys.iter().map(|k| k.as_bytes()).collect()),
        Command::Get { .. } => {
            return Err(Error::Internal(format!("refusing to log read {}", cmd)))
        }
    };

    let mut body = Vec::new();
    body.push(tag);
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in fields {
        body.extend_from_slice(&(field.len() as u32).to_le_bytes());
        body.extend_from_slice(field);
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&CMD_MAGIC);
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc32(&body).to_le_bytes());
    Ok(out)
}

/// Decode one entry from the front of `buf`, returning it and its encoded length.
fn decode_entry(buf: &[u8]) -> Result<(Command, usize)> {
    let mut cur = Cursor { buf, pos: 0 };
    if cur.take(4)? != CMD_MAGIC {
        return Err(Error::Corrupted("bad magic".into()));
    }

    let body_start = cur.pos;
    let tag = cur.take(1)?[0];
    let id = cur.u32()?;
    let count = cur.u32()? as usize;
    let mut fields = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let len = cur.u32()? as usize;
        fields.push(cur.take(len)?.to_vec());
    }
    let body_end = cur.pos;

    let checksum = cur.u32()?;
    if checksum != crc32(&buf[body_start..body_end]) {
        return Err(Error::Corrupted(format!("checksum mismatch for id {}", id)));
    }

    let cmd = match tag {
        TAG_SET => {
            if fields.len() != 2 {
                return Err(Error::Corrupted(format!("SET#{} with {} fields", id, fields.len())));
            }
            let value = fields.pop().unwrap_or_default();
            let key = fields.pop().unwrap_or_default();
            Command::Set {
                id,
                key: to_string(key)?,
                value,
            }
        }
        TAG_DEL => Command::Del {
            id,
            keys: fields
                .into_iter()
                .map(to_string)
                .collect::<Result<Vec<_>>>()?,
        },
        other => return Err(Error::Corrupted(format!("unknown command tag {}", other))),
    };
    Ok((cmd, cur.pos))
}

fn to_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::Corrupted("non UTF-8 key".into()))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corrupted("truncated entry".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
