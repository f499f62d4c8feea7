//! Full-store snapshot used to resynchronise a lagging replica.
//!
//! Format: a flat sequence of entries, each `[KEY_LEN:2 LE][KEY][VAL_LEN:2 LE][VAL]`.

use crate::common::{Error, Result, Storage};

/// Serialise every entry in `storage`.
pub fn encode(storage: &Storage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (key, value) in storage.iter_all()? {
        push_field(&mut out, key.as_bytes(), "key")?;
        push_field(&mut out, &value, "value")?;
    }
    Ok(out)
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8], what: &str) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        Error::Snapshot(format!("{} of {} bytes does not fit a snapshot entry", what, bytes.len()))
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Parse a snapshot into `(key, value)` pairs.
pub fn decode(mut buf: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        let key = take_field(&mut buf)?;
        let value = take_field(&mut buf)?;
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| Error::Snapshot("non UTF-8 key".into()))?;
        entries.push((key, value.to_vec()));
    }
    Ok(entries)
}

fn take_field<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    if buf.len() < 2 {
        return Err(Error::Snapshot("truncated length prefix".into()));
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < len {
        return Err(Error::Snapshot(format!(
            "entry claims {} bytes, {} left",
            len,
            rest.len()
        )));
    }
    let (field, tail) = rest.split_at(len);
    *buf = tail;
    Ok(field)
}

/// Apply a snapshot on top of `storage`: deletions first, then the puts.
pub fn restore(storage: &Storage, snapshot: &[u8], deleted_keys: &[String]) -> Result<usize> {
    let entries = decode(snapshot)?;
    for key in deleted_keys {
        storage.delete(key)?;
    }
    for (key, value) in &entries {
        storage.put(key, value)?;
    }
    Ok(entries.len())
}
