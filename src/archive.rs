//! Payload field encoding shared by requests and responses.
//!
//! Fields are written little-endian in order, with no padding:
//! strings and byte blobs are `u32 length | bytes`, lists are `u32 count | items`,
//! stamps are `u8 tag | i64 millis` (millis only for files).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{NetError, NetResult};
use crate::protocol::MessageKind;
use crate::toc::FileStamp;

const STAMP_ABSENT: u8 = 0;
const STAMP_DIRECTORY: u8 = 1;
const STAMP_FILE: u8 = 2;

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request payload starting with its kind tag.
    pub fn request(kind: MessageKind) -> Self {
        let mut w = Self::new();
        w.put_u32(kind as u32);
        w
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(v as u8)
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_str_list<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_str(item.as_ref());
        }
        self
    }

    pub fn put_stamp(&mut self, stamp: FileStamp) -> &mut Self {
        match stamp {
            FileStamp::Absent => self.put_u8(STAMP_ABSENT),
            FileStamp::Directory => self.put_u8(STAMP_DIRECTORY),
            FileStamp::File(ms) => self.put_u8(STAMP_FILE).put_i64(ms),
        }
    }

    /// Listing of `(path, stamp)` pairs.
    pub fn put_listing(&mut self, entries: &[(String, FileStamp)]) -> &mut Self {
        self.put_u32(entries.len() as u32);
        for (path, stamp) in entries {
            self.put_str(path);
            self.put_stamp(*stamp);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over a received payload. Integers honor the sender's byte order.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    swapped: bool,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8], swapped: bool) -> Self {
        Self { buf, swapped }
    }

    fn need(&self, n: usize, what: &str) -> NetResult<()> {
        if self.buf.remaining() < n {
            return Err(NetError::Malformed(format!(
                "{}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn get_u8(&mut self) -> NetResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self) -> NetResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> NetResult<u32> {
        self.need(4, "u32")?;
        Ok(if self.swapped {
            self.buf.get_u32()
        } else {
            self.buf.get_u32_le()
        })
    }

    pub fn get_i32(&mut self) -> NetResult<i32> {
        self.need(4, "i32")?;
        Ok(if self.swapped {
            self.buf.get_i32()
        } else {
            self.buf.get_i32_le()
        })
    }

    pub fn get_u64(&mut self) -> NetResult<u64> {
        self.need(8, "u64")?;
        Ok(if self.swapped {
            self.buf.get_u64()
        } else {
            self.buf.get_u64_le()
        })
    }

    pub fn get_i64(&mut self) -> NetResult<i64> {
        self.need(8, "i64")?;
        Ok(if self.swapped {
            self.buf.get_i64()
        } else {
            self.buf.get_i64_le()
        })
    }

    pub fn get_bytes(&mut self) -> NetResult<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.need(len, "byte blob")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_string(&mut self) -> NetResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetError::Malformed("string is not utf-8".into()))
    }

    pub fn get_str_list(&mut self) -> NetResult<Vec<String>> {
        let count = self.get_u32()? as usize;
        // Each string costs at least its length prefix
        self.need(count.saturating_mul(4), "string list")?;
        (0..count).map(|_| self.get_string()).collect()
    }

    pub fn get_stamp(&mut self) -> NetResult<FileStamp> {
        match self.get_u8()? {
            STAMP_ABSENT => Ok(FileStamp::Absent),
            STAMP_DIRECTORY => Ok(FileStamp::Directory),
            STAMP_FILE => Ok(FileStamp::File(self.get_i64()?)),
            tag => Err(NetError::Malformed(format!("unknown stamp tag {}", tag))),
        }
    }

    pub fn get_listing(&mut self) -> NetResult<Vec<(String, FileStamp)>> {
        let count = self.get_u32()? as usize;
        self.need(count.saturating_mul(5), "listing")?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let path = self.get_string()?;
            let stamp = self.get_stamp()?;
            out.push((path, stamp));
        }
        Ok(out)
    }

    pub fn get_kind(&mut self) -> NetResult<MessageKind> {
        let raw = self.get_u32()?;
        MessageKind::from_u32(raw)
            .ok_or_else(|| NetError::Malformed(format!("unknown message kind {}", raw)))
    }
}
