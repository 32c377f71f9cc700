//! Replies sent on the authority's reply channel and read from the replica's
//! request channel.

use crate::types::{StoreMap, Value};

use super::wire::{put_int, put_key, Cursor, WireError};

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `None` means the key is absent.
    Lookup(Option<Value>),
    HasKey(bool),
    Size(u64),
    /// Full store plus the sequence of the last mutation it reflects.
    Snapshot { store: StoreMap, sequence: u64 },
    /// The request could not be parsed.
    Invalid { reason: String },
}

impl Response {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut c = Cursor::new(buf);
        match c.token() {
            b"LOOKUP" => {
                c.space()?;
                if c.at_end() {
                    Ok(Response::Lookup(None))
                } else {
                    Ok(Response::Lookup(Some(c.i64()?)))
                }
            }
            b"HASKEY" => {
                c.space()?;
                match c.token() {
                    b"0" => Ok(Response::HasKey(false)),
                    b"1" => Ok(Response::HasKey(true)),
                    _ => Err(WireError::BadInteger),
                }
            }
            b"SIZE" => {
                c.space()?;
                Ok(Response::Size(c.u64()?))
            }
            b"SNAPSHOT" => {
                c.space()?;
                let sequence = c.u64()?;
                c.space()?;
                let count = c.u64()?;
                let mut store = StoreMap::default();
                for _ in 0..count {
                    c.space()?;
                    let key = c.key()?.to_vec();
                    c.space()?;
                    let value = c.i64()?;
                    store.insert(key, value);
                }
                Ok(Response::Snapshot { store, sequence })
            }
            b"INVALID" => {
                c.space()?;
                let reason = String::from_utf8_lossy(c.rest()).into_owned();
                Ok(Response::Invalid { reason })
            }
            other => Err(WireError::UnknownKind(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn prepare(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Lookup(value) => {
                buf.extend_from_slice(b"LOOKUP ");
                if let Some(v) = value {
                    put_int(&mut buf, v);
                }
            }
            Response::HasKey(exists) => {
                buf.extend_from_slice(if *exists { b"HASKEY 1" } else { b"HASKEY 0" });
            }
            Response::Size(n) => {
                buf.extend_from_slice(b"SIZE ");
                put_int(&mut buf, n);
            }
            Response::Snapshot { store, sequence } => {
                buf.extend_from_slice(b"SNAPSHOT ");
                put_int(&mut buf, sequence);
                buf.push(b' ');
                put_int(&mut buf, store.len());
                for (key, value) in store {
                    buf.push(b' ');
                    put_key(&mut buf, key);
                    buf.push(b' ');
                    put_int(&mut buf, value);
                }
            }
            Response::Invalid { reason } => {
                buf.extend_from_slice(b"INVALID ");
                buf.extend_from_slice(reason.as_bytes());
            }
        }
        buf
    }
}
