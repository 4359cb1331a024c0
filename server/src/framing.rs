//! Message framing over async streams

use docwire_core::network::{HEADER_LEN, MsgHeader};
use docwire_core::{DocWireError, DocWireResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request the server reads.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Reads one message. `None` means the peer closed the stream between
/// messages.
pub async fn read_message<R>(reader: &mut R) -> DocWireResult<Option<(MsgHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DocWireError::from_io(e)),
    }
    let header = MsgHeader::decode(&header)?;
    let body_len = header.body_len(MAX_MESSAGE_SIZE)?;

    let mut body = vec![0u8; body_len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(DocWireError::from_io)?;
    Ok(Some((header, body)))
}

pub async fn write_message<W>(writer: &mut W, message: &[u8]) -> DocWireResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(message)
        .await
        .map_err(DocWireError::from_io)?;
    writer.flush().await.map_err(DocWireError::from_io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwire_core::Bson;
    use docwire_core::network::{OpCode, Request};

    #[tokio::test]
    async fn test_read_query_message() {
        let mut query = Bson::new();
        query.append_int("ping", 1).unwrap();
        query.finish().unwrap();
        let request = Request::Query {
            flags: 0,
            ns: "admin.$cmd",
            skip: 0,
            limit: 1,
            query: query.raw().unwrap(),
            fields: None,
        };
        let bytes = request.encode(42);

        let (mut client, mut server) = tokio::io::duplex(1024);
        write_message(&mut client, &bytes).await.unwrap();
        drop(client);

        let (header, body) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(header.request_id, 42);
        assert_eq!(header.op_code(), Some(OpCode::Query));
        assert_eq!(Request::decode(OpCode::Query, &body).unwrap(), request);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_short_length() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0] = 4;
        let (mut client, mut server) = tokio::io::duplex(64);
        write_message(&mut client, &bytes).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(DocWireError::ReadSize(4))
        ));
    }
}
