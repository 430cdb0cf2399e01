//! Framed reading and writing over one peer connection.

use conclave_wire::{ConsensusMessage, Prequel, PREQUEL_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NetError;

/// Reads one frame: prequel, then payload, then decode.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Prequel, ConsensusMessage), NetError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PREQUEL_SIZE];
    reader.read_exact(&mut header).await?;
    let prequel = Prequel::decode(&header)?;

    let mut payload = vec![0u8; prequel.payload_size as usize];
    reader.read_exact(&mut payload).await?;

    let msg = ConsensusMessage::decode_frame(&prequel, &payload)?;
    Ok((prequel, msg))
}

/// Writes one pre-framed message.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use conclave_primitives::params::ConsensusKind;
    use conclave_wire::MessageType;

    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = ConsensusMessage::HeartBeat.encode_frame(ConsensusKind::Request);
        write_frame(&mut a, &frame).await.unwrap();

        let (prequel, msg) = read_frame(&mut b).await.unwrap();
        assert_eq!(prequel.message_type, MessageType::HeartBeat);
        assert_eq!(prequel.consensus_kind, ConsensusKind::Request);
        assert_eq!(msg, ConsensusMessage::HeartBeat);
    }

    #[tokio::test]
    async fn test_short_read_is_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = ConsensusMessage::TipRequest.encode_frame(ConsensusKind::Epoch);
        // Truncate mid-prequel and close.
        a.write_all(&frame[..3]).await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }
}
