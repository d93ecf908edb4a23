use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tofcast_core::ProtocolError;
use tofcast_core::bridge::{MAX_FRAME_LEN, ObservationFrame};
use tokio::io::{self, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::{BdAddr, Observation, ObservationSource};

#[derive(Debug, thiserror::Error)]
pub enum BridgeConnectionError {
    #[error("Postcard deserialization failed: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bridge frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{buffered} bytes buffered without a complete frame")]
    FrameTooLarge { buffered: usize },

    #[error("Internal observation channel closed")]
    ChannelClosed,
}

/// Accepts connections from radio bridges streaming postcard-encoded
/// [`ObservationFrame`]s.
pub struct TcpObservationSource {
    addr: SocketAddr,
}

impl TcpObservationSource {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl ObservationSource for TcpObservationSource {
    type Error = io::Error;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Observation>, Self::Error> {
        let (tx, rx) = mpsc::channel(100);
        let addr = self.addr;

        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "TCP observation source started");

        tokio::spawn(run_server_loop(listener, tx, cancel));

        Ok(rx)
    }
}

#[instrument(name = "bridge_server", skip_all)]
async fn run_server_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Observation>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Closing TCP observation source");
                break;
            }
            client = listener.accept() => {
                match client {
                    Ok((stream, addr)) => {
                        info!(%addr, "Bridge connected");

                        let cancel = cancel.clone();
                        let tx = tx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_bridge(stream, addr, tx, cancel).await {
                                error!(%addr, error = %e, "Bridge connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        if is_transient_error(&e) {
                            sleep(Duration::from_millis(100)).await;
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn is_transient_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionRefused | ConnectionAborted | ConnectionReset | OutOfMemory | Other
    )
}

/// Decode every complete frame at the front of `buf`, draining what was consumed.
///
/// A remainder that is already as long as the largest valid frame can never
/// complete, so it fails the connection instead of growing the buffer.
fn drain_frames(buf: &mut Vec<u8>) -> Result<Vec<Observation>, BridgeConnectionError> {
    let mut observations = Vec::new();
    let mut consumed = 0;

    while consumed < buf.len() {
        let (frame, rest) = match postcard::take_from_bytes::<ObservationFrame>(&buf[consumed..]) {
            Ok(v) => v,
            Err(postcard::Error::DeserializeUnexpectedEnd) => break,
            Err(e) => return Err(e.into()),
        };
        frame.validate()?;

        observations.push(Observation {
            address: BdAddr(frame.address),
            rssi: frame.rssi,
            data: frame.data.into(),
        });
        consumed = buf.len() - rest.len();
    }

    buf.drain(..consumed);
    if buf.len() >= MAX_FRAME_LEN {
        return Err(BridgeConnectionError::FrameTooLarge {
            buffered: buf.len(),
        });
    }
    Ok(observations)
}

#[instrument(name = "bridge", skip(stream, tx, cancel))]
async fn handle_bridge(
    mut stream: TcpStream,
    addr: SocketAddr,
    tx: mpsc::Sender<Observation>,
    cancel: CancellationToken,
) -> Result<(), BridgeConnectionError> {
    let mut buf: Vec<u8> = Vec::with_capacity(MAX_FRAME_LEN + 512);
    let mut tmp = [0u8; 512];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown signal received");
                break;
            }
            read = stream.read(&mut tmp) => {
                let n = read?;
                if n == 0 {
                    info!("Bridge closed connection");
                    break;
                }

                buf.extend_from_slice(&tmp[..n]);

                for observation in drain_frames(&mut buf)? {
                    debug!(address = %observation.address, rssi = observation.rssi, "Observation");
                    if tx.send(observation).await.is_err() {
                        return Err(BridgeConnectionError::ChannelClosed);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn encoded(address: [u8; 6], data: &[u8]) -> Vec<u8> {
        postcard::to_allocvec(&ObservationFrame::new(address, -50, data)).unwrap()
    }

    #[test]
    fn partial_frames_stay_buffered() {
        let first = encoded([1; 6], &[2, 0x09, b'a']);
        let second = encoded([2; 6], &[3, 0xFF, 1, 2]);

        let mut buf = first.clone();
        buf.extend_from_slice(&second[..second.len() - 1]);

        let observations = drain_frames(&mut buf).unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].address, BdAddr([1; 6]));
        assert_eq!(&*observations[0].data, &[2, 0x09, b'a']);
        assert_eq!(buf.as_slice(), &second[..second.len() - 1]);

        buf.push(second[second.len() - 1]);
        let observations = drain_frames(&mut buf).unwrap();
        assert_eq!(observations[0].address, BdAddr([2; 6]));
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_preamble_is_rejected() {
        let mut frame = ObservationFrame::new([0; 6], 0, &[]);
        frame.preamble = 0xBEEF;
        let mut buf = postcard::to_allocvec(&frame).unwrap();

        assert!(matches!(
            drain_frames(&mut buf),
            Err(BridgeConnectionError::Protocol(ProtocolError::InvalidPreamble(0xBEEF)))
        ));
    }

    #[test]
    fn oversized_remainder_fails_the_connection() {
        let bytes = encoded([3; 6], &[0u8; 2 * MAX_FRAME_LEN]);

        let mut buf = bytes[..MAX_FRAME_LEN - 1].to_vec();
        assert!(drain_frames(&mut buf).unwrap().is_empty());

        buf.push(bytes[MAX_FRAME_LEN - 1]);
        assert!(matches!(
            drain_frames(&mut buf),
            Err(BridgeConnectionError::FrameTooLarge {
                buffered: MAX_FRAME_LEN
            })
        ));
    }

    #[tokio::test]
    async fn bridge_streaming_an_endless_frame_is_disconnected() {
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_server_loop(listener, tx, cancel.clone()));

        let mut bridge = TcpStream::connect(addr).await.unwrap();
        let huge = vec![0u8; 4 * MAX_FRAME_LEN];
        let _ = bridge.write_all(&encoded([9; 6], &huge)).await;

        let mut scratch = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), bridge.read(&mut scratch))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        cancel.cancel();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_from_a_bridge_reach_the_channel() {
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(run_server_loop(listener, tx, cancel.clone()));

        let mut bridge = TcpStream::connect(addr).await.unwrap();
        bridge.write_all(&encoded([7; 6], &[1, 2, 3])).await.unwrap();
        bridge.write_all(&encoded([8; 6], &[4, 5])).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        cancel.cancel();

        assert_eq!(first.address, BdAddr([7; 6]));
        assert_eq!(&*second.data, &[4, 5]);
    }
}
