use crate::{Error, Record};
use bytes::{Bytes, BytesMut};

/// Maximum encoded size of one record, framing included.
pub const MAX_FRAME: usize = 4 * 1024;

/// Scans `buf` for the next newline-terminated record and consumes it.
///
/// Empty lines are skipped. Returns `Error::Incomplete` when no full line is
/// buffered yet, which the connection layer treats as "read more bytes".
pub fn parse(buf: &mut BytesMut) -> Result<Record, Error> {
    loop {
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = buf.split_to(pos + 1);
                let mut line = &line[..pos];
                if let Some((&b'\r', rest)) = line.split_last() {
                    line = rest;
                }
                if line.is_empty() {
                    continue;
                }
                if line.len() > MAX_FRAME {
                    return Err(Error::FrameTooLarge(line.len()));
                }
                return Ok(serde_json::from_slice(line)?);
            }
            None if buf.len() > MAX_FRAME => return Err(Error::FrameTooLarge(buf.len())),
            None => return Err(Error::Incomplete),
        }
    }
}

/// Serializes one record and appends the newline terminator.
pub fn encode(record: &Record) -> Result<Bytes, Error> {
    let mut data = serde_json::to_vec(record)?;
    data.push(b'\n');
    Ok(Bytes::from(data))
}

/// Serializes one record without framing, for use as a UDP payload.
pub fn encode_datagram(record: &Record) -> Result<Bytes, Error> {
    Ok(Bytes::from(serde_json::to_vec(record)?))
}

/// Decodes a single datagram payload.
pub fn decode_datagram(data: &[u8]) -> Result<Record, Error> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::Body;
    use bytes::BufMut;

    fn heartbeat(id: &str) -> Record {
        Record::new(Body::Heartbeat {
            server_id: id.to_string(),
            is_leader: false,
        })
    }

    #[test]
    fn test_parse_consumes_one_line() {
        let first = heartbeat("server-8001");
        let second = heartbeat("server-8002");
        let mut buf = BytesMut::new();
        buf.put_slice(&encode(&first).unwrap());
        buf.put_slice(&encode(&second).unwrap());

        assert_eq!(parse(&mut buf).unwrap(), first);
        assert_eq!(parse(&mut buf).unwrap(), second);
        assert!(matches!(parse(&mut buf), Err(Error::Incomplete)));
    }

    #[test]
    fn test_parse_incomplete_line() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"{\"type\":\"HEARTBEAT\"");
        assert!(matches!(parse(&mut buf), Err(Error::Incomplete)));
        // partial line stays buffered
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_parse_skips_empty_lines() {
        let record = heartbeat("server-8001");
        let mut buf = BytesMut::new();
        buf.put_slice(b"\n\r\n");
        buf.put_slice(&encode(&record).unwrap());
        assert_eq!(parse(&mut buf).unwrap(), record);
    }

    #[test]
    fn test_parse_malformed_line() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"not json at all\n");
        assert!(matches!(parse(&mut buf), Err(Error::Malformed(_))));
        // the bad line was consumed, the stream is not desynced
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_oversized_line() {
        let mut buf = BytesMut::new();
        buf.put_slice(&vec![b'x'; MAX_FRAME + 1]);
        assert!(matches!(parse(&mut buf), Err(Error::FrameTooLarge(_))));
    }

    #[test]
    fn test_encode_appends_newline() {
        let data = encode(&heartbeat("server-8001")).unwrap();
        assert_eq!(data.last(), Some(&b'\n'));
        assert_eq!(data.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_datagram_round_trip() {
        let record = Record::new(Body::DiscoveryAnnounce {
            server_id: "server-8001".to_string(),
            ip: "192.168.1.10".to_string(),
            port: 8001,
        });
        let data = encode_datagram(&record).unwrap();
        assert_eq!(decode_datagram(&data).unwrap(), record);
    }
}
