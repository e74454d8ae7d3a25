/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS stream framing.
//!
//! Stream transports (TCP, DoT, DoQ) carry each DNS message behind a 2-byte
//! big-endian length prefix. The pure helpers [`frame`] and [`unframe`] work on
//! whole buffers; [`read_framed`] and [`write_framed`] do the same over an
//! async byte stream. A frame whose declared length disagrees with the bytes
//! actually present is rejected as a whole, never partially delivered.

pub mod buffer_pool;

use crate::core::error::{DnsError, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Smallest framed buffer worth decoding: DNS header (12) plus a minimal question (5)
pub const MIN_DNS_PACKET_SIZE: usize = 12 + 5;

/// Prepend the 2-byte big-endian length of `payload`.
///
/// No size limit is enforced here; callers keep payloads within `u16::MAX`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    out.to_vec()
}

/// Strip and verify the length prefix of a complete framed buffer.
///
/// Returns `None` when the buffer is shorter than [`MIN_DNS_PACKET_SIZE`] or
/// when the declared length is not exactly `bytes.len() - 2`.
pub fn unframe(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < MIN_DNS_PACKET_SIZE {
        return None;
    }
    let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if declared != bytes.len() - LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(&bytes[LENGTH_PREFIX_SIZE..])
}

/// Read one length-prefixed message body from a stream.
///
/// EOF before or inside the frame surfaces as an I/O error so callers can
/// tell a closed peer from a malformed message.
pub async fn read_framed<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_prefix).await?;
    let msg_len = u16::from_be_bytes(len_prefix) as usize;
    if msg_len == 0 {
        return Err(DnsError::protocol("zero length DNS frame"));
    }

    let mut buf = vec![0u8; msg_len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write `payload` as a single length-prefixed frame and flush.
pub async fn write_framed<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        return Err(DnsError::protocol(format!(
            "DNS message too large: {} bytes (max 65535)",
            payload.len()
        )));
    }
    // Merge length prefix and body into a single write
    writer.write_all(&frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_frame_prefix_is_big_endian() {
        let framed = frame(&payload(300));
        assert_eq!(&framed[..2], &[0x01, 0x2c]);
        assert_eq!(framed.len(), 302);
    }

    #[test]
    fn test_unframe_returns_payload() {
        let body = payload(40);
        let framed = frame(&body);
        assert_eq!(unframe(&framed), Some(body.as_slice()));
    }

    #[test]
    fn test_unframe_minimum_size() {
        // 15 payload bytes + prefix = 17, exactly the minimum
        let framed = frame(&payload(15));
        assert_eq!(framed.len(), MIN_DNS_PACKET_SIZE);
        assert!(unframe(&framed).is_some());

        let short = frame(&payload(14));
        assert!(unframe(&short).is_none());
    }

    #[test]
    fn test_unframe_rejects_length_mismatch() {
        let mut framed = frame(&payload(40));
        // declared longer than present
        framed[1] = 41;
        assert!(unframe(&framed).is_none());
        // declared shorter than present, never truncated
        framed[1] = 39;
        assert!(unframe(&framed).is_none());
        // trailing garbage after a valid frame
        let mut trailing = frame(&payload(40));
        trailing.push(0);
        assert!(unframe(&trailing).is_none());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let body = payload(64);
        write_framed(&mut client, &body).await.unwrap();
        let read = read_framed(&mut server).await.unwrap();
        assert_eq!(read, body);
    }

    #[tokio::test]
    async fn test_stream_eof_is_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_framed(&mut server).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_stream_truncated_body_is_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x00, 0x20, 1, 2, 3]).await.unwrap();
        drop(client);
        let err = read_framed(&mut server).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_write_rejects_oversized() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = write_framed(&mut client, &vec![0u8; 70_000])
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Protocol(_)));
    }
}
