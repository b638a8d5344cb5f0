//! Operator-side video receiver.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::assembler::FrameAssembler;
use super::chunk::{FrameChunk, HEADER_LEN};

const RECV_BUFFER: usize = 65_536;

/// A reassembled frame that decoded as an image.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// Receives chunked frames on a UDP port and yields the ones that decode.
///
/// Malformed packets and undecodable frames are logged and skipped.
pub struct VideoReceiver {
    socket: UdpSocket,
    assembler: FrameAssembler,
}

impl VideoReceiver {
    pub async fn bind(addr: SocketAddr, max_frame_age: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("Video receiver listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            assembler: FrameAssembler::new(max_frame_age),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Forward decoded frames to `tx` until cancelled or the channel closes.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<DecodedFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut buf = BytesMut::zeroed(RECV_BUFFER);
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv(&mut buf) => r?,
            };
            if n <= HEADER_LEN {
                tracing::debug!("Ignoring {}-byte packet", n);
                continue;
            }

            let packet = buf.split_to(n).freeze();
            buf.resize(RECV_BUFFER, 0);

            let chunk = match FrameChunk::decode(packet) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!("Bad video packet: {}", e);
                    continue;
                }
            };
            let frame_id = chunk.header.frame_id;
            let Some(jpeg) = self.assembler.push(chunk, Instant::now()) else {
                continue;
            };

            match image::load_from_memory(&jpeg) {
                Ok(img) => {
                    let frame = DecodedFrame {
                        frame_id,
                        width: img.width(),
                        height: img.height(),
                        jpeg,
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Frame {} failed to decode: {}", frame_id, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::chunk::split_frame;
    use crate::video::source::{FrameSource, TestPattern};
    use crate::video::RESOLUTIONS;

    #[tokio::test]
    async fn test_receives_out_of_order_frame() {
        let receiver = VideoReceiver::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receiver.run(tx, cancel.clone()));

        let jpeg = TestPattern::new(160, 120, 1000)
            .capture_jpeg(RESOLUTIONS[4], 60)
            .unwrap();
        let mut packets = split_frame(7, &jpeg, 200).unwrap();
        packets.reverse();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"junk", addr).await.unwrap();
        sender.send_to(&split_frame(6, b"not a jpeg", 200).unwrap()[0], addr).await.unwrap();
        for p in &packets {
            sender.send_to(p, addr).await.unwrap();
        }

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.frame_id, 7);
        assert_eq!((frame.width, frame.height), (160, 120));
        assert_eq!(frame.jpeg, jpeg);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
