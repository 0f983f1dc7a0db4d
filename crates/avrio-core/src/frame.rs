//! Framed record codecs.
//!
//! Two wire dialects carry the same semantics: a record is an optional 32-bit
//! id plus an ordered list of byte slices.
//!
//! * [`Dialect::Standard`]: a record is a run of length-prefixed frames closed
//!   by a zero-length frame; no id travels on the wire.
//! * [`Dialect::Netty`]: a record opens with an 8-byte `[id, frame count]`
//!   header followed by that many length-prefixed frames; no terminator.
//!
//! The dialects are not interchangeable; both peers of a channel must agree.
//! Stateless channels default to the standard dialect, stateful channels to
//! the netty dialect.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorCode, RpcError};

/// Maximum length accepted for a single frame (16 MB).
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Maximum frame count accepted in a netty record header.
const MAX_FRAME_COUNT: usize = 1024;

/// Chunk size for the async record reader.
const READ_CHUNK: usize = 16 * 1024;

/// Wire dialect for framed records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// Length-prefixed frames terminated by an empty frame; id-less.
    Standard,
    /// `[int32 id, int32 frameCount]` header, then the declared frames.
    Netty,
}

/// A de-framed record: an optional multiplexing id and the payload frames.
///
/// Consumers treat the payload as the concatenation of its frames; the split
/// only exists so encoders can avoid copying independently produced buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: Option<i32>,
    pub payload: Vec<Bytes>,
}

impl Record {
    pub fn new(id: Option<i32>, payload: Vec<Bytes>) -> Self {
        Self { id, payload }
    }

    /// The payload frames joined into one buffer.
    pub fn body(&self) -> Bytes {
        match self.payload.len() {
            0 => Bytes::new(),
            1 => self.payload[0].clone(),
            _ => {
                let total = self.payload.iter().map(|f| f.len()).sum();
                let mut buf = BytesMut::with_capacity(total);
                for frame in &self.payload {
                    buf.put_slice(frame);
                }
                buf.freeze()
            }
        }
    }
}

/// Encode one record into `out` using the given dialect.
pub fn encode_record(dialect: Dialect, record: &Record, out: &mut BytesMut) {
    match dialect {
        Dialect::Standard => {
            for frame in &record.payload {
                out.put_u32(frame.len() as u32);
                out.put_slice(frame);
            }
            out.put_u32(0);
        }
        Dialect::Netty => {
            out.put_i32(record.id.unwrap_or(0));
            out.put_i32(record.payload.len() as i32);
            for frame in &record.payload {
                out.put_u32(frame.len() as u32);
                out.put_slice(frame);
            }
        }
    }
}

/// Incremental record decoder.
///
/// Feed arbitrary byte fragments in; complete records come out. Packet
/// boundaries may fall anywhere, including inside length prefixes.
#[derive(Debug)]
pub struct RecordDecoder {
    dialect: Dialect,
    buf: BytesMut,
    frames: Vec<Bytes>,
    /// Netty only: header of the record in progress.
    header: Option<(i32, usize)>,
}

impl RecordDecoder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            buf: BytesMut::new(),
            frames: Vec::new(),
            header: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete record, if the buffered bytes contain one.
    pub fn next_record(&mut self) -> Result<Option<Record>, RpcError> {
        match self.dialect {
            Dialect::Standard => self.next_standard(),
            Dialect::Netty => self.next_netty(),
        }
    }

    /// Check for leftover bytes once the stream has ended.
    pub fn finish(&self) -> Result<(), RpcError> {
        if self.buf.is_empty() && self.frames.is_empty() && self.header.is_none() {
            Ok(())
        } else {
            Err(RpcError::new(
                ErrorCode::Framing,
                "stream ended inside a framed record",
            ))
        }
    }

    fn next_standard(&mut self) -> Result<Option<Record>, RpcError> {
        loop {
            let Some(len) = self.peek_len()? else {
                return Ok(None);
            };
            if len == 0 {
                self.buf.advance(4);
                let payload = std::mem::take(&mut self.frames);
                return Ok(Some(Record::new(None, payload)));
            }
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            self.buf.advance(4);
            self.frames.push(self.buf.split_to(len).freeze());
        }
    }

    fn next_netty(&mut self) -> Result<Option<Record>, RpcError> {
        loop {
            let (id, count) = match self.header {
                Some(h) => h,
                None => {
                    if self.buf.len() < 8 {
                        return Ok(None);
                    }
                    let id = i32::from_be_bytes([
                        self.buf[0], self.buf[1], self.buf[2], self.buf[3],
                    ]);
                    let count = i32::from_be_bytes([
                        self.buf[4], self.buf[5], self.buf[6], self.buf[7],
                    ]);
                    if count < 0 || count as usize > MAX_FRAME_COUNT {
                        return Err(RpcError::new(
                            ErrorCode::Framing,
                            format!("invalid frame count: {}", count),
                        ));
                    }
                    self.buf.advance(8);
                    self.header = Some((id, count as usize));
                    (id, count as usize)
                }
            };

            if self.frames.len() == count {
                self.header = None;
                let payload = std::mem::take(&mut self.frames);
                return Ok(Some(Record::new(Some(id), payload)));
            }

            let Some(len) = self.peek_len()? else {
                return Ok(None);
            };
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            self.buf.advance(4);
            self.frames.push(self.buf.split_to(len).freeze());
        }
    }

    fn peek_len(&self) -> Result<Option<usize>, RpcError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::new(
                ErrorCode::Framing,
                format!("frame length {} exceeds maximum {}", len, MAX_FRAME_LEN),
            ));
        }
        Ok(Some(len))
    }
}

/// Read the next record from `reader`, buffering through `decoder`.
///
/// Returns `None` on a clean end of stream. A stream that ends mid-record is
/// a framing error.
pub async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut RecordDecoder,
) -> Result<Option<Record>, RpcError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(record) = decoder.next_record()? {
            return Ok(Some(record));
        }
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| RpcError::with_source(ErrorCode::Transport, "read failed", e))?;
        if n == 0 {
            decoder.finish()?;
            return Ok(None);
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Encode and write one record, then flush.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    dialect: Dialect,
    record: &Record,
) -> Result<(), RpcError> {
    let mut buf = BytesMut::new();
    encode_record(dialect, record, &mut buf);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| RpcError::with_source(ErrorCode::Transport, "write failed", e))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::with_source(ErrorCode::Transport, "flush failed", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Option<i32>, frames: &[&str]) -> Record {
        Record::new(
            id,
            frames.iter().map(|f| Bytes::copy_from_slice(f.as_bytes())).collect(),
        )
    }

    fn encode(dialect: Dialect, records: &[Record]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for r in records {
            encode_record(dialect, r, &mut buf);
        }
        buf.to_vec()
    }

    fn decode_all(dialect: Dialect, bytes: &[u8]) -> Vec<Record> {
        let mut decoder = RecordDecoder::new(dialect);
        decoder.feed(bytes);
        let mut out = Vec::new();
        while let Some(r) = decoder.next_record().unwrap() {
            out.push(r);
        }
        decoder.finish().unwrap();
        out
    }

    #[test]
    fn standard_roundtrip() {
        let records = vec![
            record(None, &["hello", "world"]),
            record(None, &[""]),
            record(None, &[]),
        ];
        let bytes = encode(Dialect::Standard, &records);
        let decoded = decode_all(Dialect::Standard, &bytes);
        assert_eq!(decoded, records);
    }

    #[test]
    fn netty_roundtrip_preserves_ids() {
        let records = vec![
            record(Some(7), &["abc"]),
            record(Some(-1), &["x", "y", "z"]),
            record(Some(0x0001_0002), &[]),
        ];
        let bytes = encode(Dialect::Netty, &records);
        let decoded = decode_all(Dialect::Netty, &bytes);
        assert_eq!(decoded, records);
    }

    #[test]
    fn fragmented_input_decodes_identically() {
        let records = vec![
            record(Some(1), &["first payload"]),
            record(Some(2), &["second", "payload"]),
            record(Some(3), &[core::str::from_utf8(&[0x30; 300]).unwrap()]),
        ];
        let bytes = encode(Dialect::Netty, &records);
        let whole = decode_all(Dialect::Netty, &bytes);

        // Feed one byte at a time: packet boundaries anywhere.
        let mut decoder = RecordDecoder::new(Dialect::Netty);
        let mut fragmented = Vec::new();
        for b in &bytes {
            decoder.feed(std::slice::from_ref(b));
            while let Some(r) = decoder.next_record().unwrap() {
                fragmented.push(r);
            }
        }
        decoder.finish().unwrap();
        assert_eq!(fragmented, whole);

        // And in irregular chunks.
        let mut decoder = RecordDecoder::new(Dialect::Netty);
        let mut chunked = Vec::new();
        for chunk in bytes.chunks(7) {
            decoder.feed(chunk);
            while let Some(r) = decoder.next_record().unwrap() {
                chunked.push(r);
            }
        }
        assert_eq!(chunked, whole);
    }

    #[test]
    fn standard_fragmented_terminator() {
        let records = vec![record(None, &["payload"])];
        let bytes = encode(Dialect::Standard, &records);
        let mut decoder = RecordDecoder::new(Dialect::Standard);
        let (head, tail) = bytes.split_at(bytes.len() - 2);
        decoder.feed(head);
        assert!(decoder.next_record().unwrap().is_none());
        decoder.feed(tail);
        assert_eq!(decoder.next_record().unwrap().unwrap(), records[0]);
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut decoder = RecordDecoder::new(Dialect::Standard);
        decoder.feed(&[0, 0]);
        assert!(decoder.next_record().unwrap().is_none());
        let err = decoder.finish().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Framing);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = RecordDecoder::new(Dialect::Standard);
        decoder.feed(&u32::MAX.to_be_bytes());
        let err = decoder.next_record().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Framing);
    }

    #[test]
    fn netty_negative_frame_count_is_rejected() {
        let mut decoder = RecordDecoder::new(Dialect::Netty);
        decoder.feed(&1i32.to_be_bytes());
        decoder.feed(&(-2i32).to_be_bytes());
        let err = decoder.next_record().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Framing);
    }

    #[test]
    fn body_concatenates_frames() {
        let r = record(Some(1), &["ab", "", "cd"]);
        assert_eq!(&r.body()[..], b"abcd");
    }

    #[tokio::test]
    async fn async_reader_handles_split_writes() {
        let (mut a, b) = tokio::io::duplex(64);
        let records = vec![
            record(Some(5), &["one"]),
            record(Some(6), &["two", "three"]),
        ];
        let expect = records.clone();
        let writer = tokio::spawn(async move {
            for r in &records {
                write_record(&mut a, Dialect::Netty, r).await.unwrap();
            }
        });

        let (mut rx, _tx) = tokio::io::split(b);
        let mut decoder = RecordDecoder::new(Dialect::Netty);
        let first = read_record(&mut rx, &mut decoder).await.unwrap().unwrap();
        let second = read_record(&mut rx, &mut decoder).await.unwrap().unwrap();
        assert_eq!(first, expect[0]);
        assert_eq!(second, expect[1]);
        writer.await.unwrap();
    }
}
