//! Transport helpers shared by the listeners and the upstream
//! exchange.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// The biggest payload a plain UDP response can carry.
pub const UDP_PAYLOAD_LIMIT: usize = 512;

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message differs from a UDP one only in carrying a
/// big-endian u16 length prefix, so the whole message can be read
/// before parsing begins.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    match stream.read_u16().await {
        Ok(size) => {
            let expected = size as usize;
            let mut bytes = BytesMut::with_capacity(expected);
            while bytes.len() < expected {
                match stream.read_buf(&mut bytes).await {
                    Ok(0) if bytes.len() < expected => {
                        return Err(TcpError::TooShort {
                            id: id_prefix(&bytes),
                            expected,
                            actual: bytes.len(),
                        });
                    }
                    Err(error) => {
                        return Err(TcpError::IO {
                            id: id_prefix(&bytes),
                            error,
                        });
                    }
                    _ => (),
                }
            }
            Ok(bytes)
        }
        Err(error) => Err(TcpError::IO { id: None, error }),
    }
}

fn id_prefix(bytes: &BytesMut) -> Option<u16> {
    if bytes.len() >= 2 {
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

/// An error that can occur when reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    IO {
        id: Option<u16>,
        error: io::Error,
    },
}

impl TcpError {
    pub fn id(&self) -> Option<u16> {
        match self {
            TcpError::TooShort { id, .. } | TcpError::IO { id, .. } => *id,
        }
    }
}

/// Write a serialised message to a connected UDP socket.  This sets or
/// clears the TC flag as appropriate.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &mut [u8]) -> Result<(), io::Error> {
    if bytes.len() > UDP_PAYLOAD_LIMIT {
        bytes[2] |= 0b0000_0010;
        sock.send(&bytes[..UDP_PAYLOAD_LIMIT]).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send(bytes).await?;
    }

    Ok(())
}

/// Like `send_udp_bytes` but sends to the given address.
pub async fn send_udp_bytes_to(
    sock: &UdpSocket,
    target: SocketAddr,
    bytes: &mut [u8],
) -> Result<(), io::Error> {
    if bytes.len() > UDP_PAYLOAD_LIMIT {
        bytes[2] |= 0b0000_0010;
        sock.send_to(&bytes[..UDP_PAYLOAD_LIMIT], target).await?;
    } else {
        bytes[2] &= 0b1111_1101;
        sock.send_to(bytes, target).await?;
    }

    Ok(())
}

/// Write a serialised message to a TCP stream, with the two-octet
/// length prefix.  Messages too big for the prefix are truncated and
/// flagged TC.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &mut [u8]) -> Result<(), io::Error> {
    let len = if let Ok(len) = u16::try_from(bytes.len()) {
        bytes[2] &= 0b1111_1101;
        len
    } else {
        bytes[2] |= 0b0000_0010;
        u16::MAX
    };

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..(len as usize)]).await?;

    Ok(())
}
