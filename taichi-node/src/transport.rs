//! Mailbox transport: one outbound TCP stream per peer (handshake, then
//! length-prefixed frames) and a listener that turns inbound streams into
//! `(peer, payload)` pairs for the membership loop.

use std::io;
use std::time::Duration;

use taichi_core::endpoint::parse_endpoint;
use taichi_core::wire::LEN_SIZE;
use taichi_core::{
    encode_frame, frame_len, handshake_bytes, parse_handshake, Connector, Mailbox, PeerId,
    TransportError, HANDSHAKE_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Frames queued per peer before sends report `WouldBlock`.
pub const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Inbound {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = frame_len(len_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub struct TcpConnector {
    me: PeerId,
    tracker: TaskTracker,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(me: PeerId, tracker: TaskTracker, connect_timeout: Duration) -> Self {
        Self {
            me,
            tracker,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, endpoint: &str) -> Result<Box<dyn Mailbox>, TransportError> {
        let (host, port) = parse_endpoint(endpoint)?;
        let addr = format!("{host}:{port}");
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.tracker
            .spawn(write_loop(self.me, addr, self.connect_timeout, rx));
        Ok(Box::new(TcpMailbox { tx }))
    }
}

struct TcpMailbox {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Mailbox for TcpMailbox {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::WouldBlock,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Connect, introduce ourselves, then drain the mailbox until it is dropped.
async fn write_loop(
    me: PeerId,
    addr: String,
    connect_timeout: Duration,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "mailbox connect failed");
            return;
        }
        Err(_) => {
            debug!(%addr, "mailbox connect timed out");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "cannot set TCP_NODELAY");
    }
    if let Err(e) = stream.write_all(&handshake_bytes(&me)).await {
        debug!(%addr, error = %e, "handshake failed");
        return;
    }
    while let Some(payload) = rx.recv().await {
        let frame = match encode_frame(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(%addr, error = %e, "dropping oversized message");
                continue;
            }
        };
        if let Err(e) = stream.write_all(&frame).await {
            debug!(%addr, error = %e, "mailbox write failed");
            return;
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!(%addr, error = %e, "mailbox shutdown failed");
    }
}

/// Accept mailbox streams until cancelled.
pub async fn run_listener(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, from) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        trace!(%from, "mailbox stream accepted");
        let inbound = inbound.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = read_loop(stream, inbound) => {
                    if let Err(e) = res {
                        debug!(%from, error = %e, "mailbox stream closed");
                    }
                }
            }
        });
    }
}

async fn read_loop(mut stream: TcpStream, inbound: mpsc::Sender<Inbound>) -> io::Result<()> {
    let mut hs = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut hs).await?;
    let from = parse_handshake(&hs)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad mailbox handshake"))?;
    while let Some(payload) = read_frame(&mut stream).await? {
        if inbound.send(Inbound { from, payload }).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use taichi_core::ZreMessage;

    #[tokio::test]
    async fn mailbox_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        tracker.spawn(run_listener(listener, tx, tracker.clone(), cancel.clone()));

        let me = PeerId::generate();
        let mut connector = TcpConnector::new(me, tracker.clone(), Duration::from_secs(1));
        let mut mailbox = connector
            .connect(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();
        let ping = ZreMessage::Ping { sequence: 7 }.encode().unwrap();
        mailbox.send(ping.clone()).unwrap();
        mailbox.send(Vec::new()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.from, me);
        assert_eq!(first.payload, ping);
        assert!(rx.recv().await.unwrap().payload.is_empty());

        drop(mailbox);
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn unreachable_mailbox_reports_closed() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let tracker = TaskTracker::new();
        let mut connector =
            TcpConnector::new(PeerId::generate(), tracker.clone(), Duration::from_secs(1));
        let mut mailbox = connector
            .connect(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();
        tracker.close();
        tracker.wait().await;
        assert!(matches!(
            mailbox.send(vec![1]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let mut connector =
            TcpConnector::new(PeerId::generate(), TaskTracker::new(), Duration::from_secs(1));
        assert!(matches!(
            connector.connect("udp://nowhere"),
            Err(TransportError::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let mut bytes = (taichi_core::wire::MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let mut reader = &bytes[..];
        assert!(read_frame(&mut reader).await.is_err());
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }
}
