use crate::Result;
use bytes::{Bytes, BytesMut};
use ringchat_codec::{self as codec, Error, Record};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

/// A framed, buffered view over one TCP socket.
///
/// Records are newline-delimited; malformed lines are logged and dropped
/// without desyncing the stream.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads the next record. `Ok(None)` means the peer closed cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Record>> {
        next_frame(&mut self.stream, &mut self.buffer).await
    }

    pub async fn write_frame(&mut self, record: &Record) -> io::Result<()> {
        let data = codec::encode(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await
    }

    /// Writes an already-encoded frame, used when one record fans out to
    /// many sockets.
    pub async fn write_raw(&mut self, data: &Bytes) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Splits into independently owned read and write halves, carrying any
    /// already-buffered bytes over to the reader.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_inner().into_split();
        (
            FrameReader {
                stream: read,
                buffer: self.buffer,
            },
            FrameWriter {
                stream: BufWriter::new(write),
            },
        )
    }
}

#[derive(Debug)]
pub struct FrameReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

impl FrameReader {
    pub async fn read_frame(&mut self) -> Result<Option<Record>> {
        next_frame(&mut self.stream, &mut self.buffer).await
    }
}

#[derive(Debug)]
pub struct FrameWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, record: &Record) -> io::Result<()> {
        let data = codec::encode(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.write_raw(&data).await
    }

    pub async fn write_raw(&mut self, data: &Bytes) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }
}

async fn next_frame<S>(stream: &mut S, buffer: &mut BytesMut) -> Result<Option<Record>>
where
    S: AsyncRead + Unpin,
{
    loop {
        match codec::parse(buffer) {
            Ok(record) => return Ok(Some(record)),
            Err(Error::Incomplete) => {}
            Err(Error::Malformed(err)) => {
                warn!(cause = %err, "dropping malformed frame");
                continue;
            }
            Err(err) => return Err(err.into()),
        }

        // There is not enough buffered data to frame a record. `0` from the
        // socket indicates "end of stream".
        if 0 == stream.read_buf(buffer).await? {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err("connection reset by peer".into())
            };
        }
    }
}
