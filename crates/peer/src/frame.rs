//! The data-channel wire protocol: each frame is tagged either `{str: text}`
//! or `{buffer: bytes}`. Concretely encoded here as `[tag: u8][len: u32
//! BE][payload]`, `tag == 0` for `str` (UTF-8), `tag == 1` for `buffer`.

use bytes::{Bytes, BytesMut};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const TAG_STR: u8 = 0;
const TAG_BUFFER: u8 = 1;

/// A single frame carried on a data channel: control/handshake text, or
/// forwarded TCP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    Str(String),
    Buffer(Bytes),
}

impl DataFrame {
    pub fn is_str(&self) -> bool {
        matches!(self, DataFrame::Str(_))
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, DataFrame::Buffer(_))
    }

    pub fn into_str(self) -> Option<String> {
        match self {
            DataFrame::Str(s) => Some(s),
            DataFrame::Buffer(_) => None,
        }
    }

    pub fn into_buffer(self) -> Option<Bytes> {
        match self {
            DataFrame::Buffer(b) => Some(b),
            DataFrame::Str(_) => None,
        }
    }

    fn encode(&self) -> Bytes {
        let (tag, payload): (u8, &[u8]) = match self {
            DataFrame::Str(s) => (TAG_STR, s.as_bytes()),
            DataFrame::Buffer(b) => (TAG_BUFFER, b.as_ref()),
        };
        let mut out = BytesMut::with_capacity(5 + payload.len());
        out.extend_from_slice(&[tag]);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out.freeze()
    }
}

/// Write one frame, length-prefixed, to an async substream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &DataFrame,
) -> std::io::Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

/// Read one frame from an async substream. Returns `Ok(None)` on a clean
/// EOF with no partial frame pending.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<DataFrame>> {
    let mut header = [0u8; 5];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match tag {
        TAG_STR => {
            let text = String::from_utf8(payload)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(Some(DataFrame::Str(text)))
        }
        TAG_BUFFER => Ok(Some(DataFrame::Buffer(Bytes::from(payload)))),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown data-channel frame tag {other}"),
        )),
    }
}

/// Write a channel's string label as a small length-prefixed header; the
/// first bytes on every substream this adapter opens, so the accepting side
/// can associate the stream with the right session before any `DataFrame`s
/// arrive.
pub async fn write_label<W: AsyncWrite + Unpin>(writer: &mut W, label: &str) -> std::io::Result<()> {
    let bytes = label.as_bytes();
    writer.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

pub async fn read_label<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_str_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &DataFrame::Str("hello".into())).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, DataFrame::Str("hello".into()));
    }

    #[tokio::test]
    async fn round_trips_a_buffer_frame() {
        let mut buf = Vec::new();
        let payload = Bytes::from_static(b"binary payload");
        write_frame(&mut buf, &DataFrame::Buffer(payload.clone())).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame, DataFrame::Buffer(payload));
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trips_label_header() {
        let mut buf = Vec::new();
        write_label(&mut buf, "c7").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_label(&mut cursor).await.unwrap(), "c7");
    }
}
