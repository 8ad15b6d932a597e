//! File-sync client actor. One task per publisher runs a [`ClientEngine`]
//! over a TCP link; [`SyncClient`] is the caller's half-duplex handle plus
//! the notification stream.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use taichi_core::endpoint::parse_endpoint;
use taichi_core::{
    encode_frame, ClientEngine, ClientEvent, ClientOutput, ClientState, FmqMessage, Notification,
    Reply, ServerLink, TransportError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::transport::read_frame;

const LINK_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("file-sync client has stopped")]
    Stopped,
    #[error("{0}")]
    Failed(String),
}

fn check(reply: Reply) -> Result<(), ClientError> {
    match reply {
        Reply::Success => Ok(()),
        Reply::Failure(reason) => Err(ClientError::Failed(reason)),
    }
}

enum Request {
    Command(ClientEvent, oneshot::Sender<Reply>),
    Connected(oneshot::Sender<bool>),
    Flush(oneshot::Sender<()>),
}

enum LinkEvent {
    Message(FmqMessage),
    Closed,
}

/// Server link over TCP. The stream is dialed by the actor before the
/// engine's connect action runs, so connect failures surface synchronously.
struct TcpLink {
    dialed: Option<io::Result<TcpStream>>,
    writer: Option<mpsc::Sender<Vec<u8>>>,
    events: mpsc::Sender<LinkEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ServerLink for TcpLink {
    fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        let stream = match self.dialed.take() {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => return Err(TransportError::Io(e)),
            None => return Err(TransportError::Closed),
        };
        trace!(%endpoint, "server link up");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "cannot set TCP_NODELAY on server link");
        }
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(LINK_CAPACITY);
        self.writer = Some(tx);

        self.tracker.spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "server link shutdown failed");
            }
        });

        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    frame = read_frame(&mut reader) => frame,
                };
                let payload = match frame {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "server link read failed");
                        break;
                    }
                };
                match FmqMessage::decode(&payload) {
                    Ok(msg) => {
                        if events.send(LinkEvent::Message(msg)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed server message"),
                }
            }
            if events.send(LinkEvent::Closed).await.is_err() {
                debug!("server link closed after client stopped");
            }
        });
        Ok(())
    }

    fn send(&mut self, msg: &FmqMessage) -> Result<(), TransportError> {
        let writer = self.writer.as_ref().ok_or(TransportError::Closed)?;
        let bytes = msg
            .encode()
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let frame = encode_frame(&bytes)
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        writer.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::WouldBlock,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Actor {
    engine: ClientEngine<TcpLink>,
    requests: mpsc::Receiver<Request>,
    link_events: mpsc::Receiver<LinkEvent>,
    notifications: mpsc::UnboundedSender<Notification>,
    pending: Option<oneshot::Sender<Reply>>,
    expiry: Option<Instant>,
}

impl Actor {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let expiry = self.expiry;
            let outputs = tokio::select! {
                _ = cancel.cancelled() => {
                    let out = self.say_goodbye();
                    self.dispatch(out);
                    break;
                }
                req = self.requests.recv() => match req {
                    Some(Request::Command(event, reply)) => {
                        self.pending = Some(reply);
                        self.command(event).await
                    }
                    Some(Request::Connected(reply)) => {
                        if reply.send(self.engine.connected()).is_err() {
                            debug!("connected query dropped by caller");
                        }
                        continue;
                    }
                    Some(Request::Flush(ack)) => {
                        if ack.send(()).is_err() {
                            debug!("flush abandoned by caller");
                        }
                        continue;
                    }
                    None => {
                        let out = self.say_goodbye();
                        self.dispatch(out);
                        break;
                    }
                },
                Some(ev) = self.link_events.recv() => match ev {
                    LinkEvent::Message(msg) => {
                        self.rearm();
                        self.engine.on_message(msg)
                    }
                    LinkEvent::Closed => self.engine.handle(ClientEvent::BombMsg),
                },
                _ = tokio::time::sleep_until(expiry.unwrap_or_else(Instant::now)), if expiry.is_some() => {
                    self.expiry = None;
                    let out = self.engine.handle(ClientEvent::Expired);
                    self.rearm();
                    out
                }
            };
            if self.dispatch(outputs) && self.engine.state() == ClientState::Subscribed {
                let out = self.engine.handle(ClientEvent::Finished);
                self.dispatch(out);
            }
        }
    }

    fn say_goodbye(&mut self) -> Vec<ClientOutput> {
        if self.engine.is_stopped() {
            return Vec::new();
        }
        self.engine.handle(ClientEvent::Destructor)
    }

    async fn command(&mut self, event: ClientEvent) -> Vec<ClientOutput> {
        if let ClientEvent::Connect { endpoint, timeout } = &event {
            if self.engine.state() == ClientState::Start && !self.engine.is_stopped() {
                let dialed = dial(endpoint, *timeout).await;
                self.engine.link_mut().dialed = Some(dialed);
            }
        }
        let connect = matches!(event, ClientEvent::Connect { .. });
        let out = self.engine.handle(event);
        if connect {
            self.rearm();
        }
        out
    }

    fn rearm(&mut self) {
        self.expiry = self.engine.timeout().map(|t| Instant::now() + t);
    }

    /// Hand outputs to the caller. Returns true when a file was completed.
    fn dispatch(&mut self, outputs: Vec<ClientOutput>) -> bool {
        let mut finished = false;
        for output in outputs {
            match output {
                ClientOutput::Reply(reply) => match self.pending.take() {
                    Some(tx) => {
                        if let Err(reply) = tx.send(reply) {
                            debug!(?reply, "caller stopped waiting for reply");
                        }
                    }
                    None => debug!(?reply, "reply with nobody waiting"),
                },
                ClientOutput::Notify(n) => {
                    finished |= matches!(n, Notification::FileUpdated { .. });
                    if let Err(e) = self.notifications.send(n) {
                        debug!(notification = ?e.0, "notification dropped, receiver gone");
                    }
                }
            }
        }
        finished
    }
}

async fn dial(endpoint: &str, timeout: Duration) -> io::Result<TcpStream> {
    let (host, port) = parse_endpoint(endpoint)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

pub struct SyncClient {
    requests: mpsc::Sender<Request>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl SyncClient {
    /// Start the actor on `tracker`. Cancelling `cancel` sends the
    /// destructor and ends the task.
    pub fn spawn(tracker: &TaskTracker, cancel: CancellationToken) -> Self {
        let (req_tx, requests) = mpsc::channel(8);
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let (link_tx, link_events) = mpsc::channel(LINK_CAPACITY);
        let link = TcpLink {
            dialed: None,
            writer: None,
            events: link_tx,
            tracker: tracker.clone(),
            shutdown: CancellationToken::new(),
        };
        let actor = Actor {
            engine: ClientEngine::new(link),
            requests,
            link_events,
            notifications: notify_tx,
            pending: None,
            expiry: None,
        };
        tracker.spawn(actor.run(cancel));
        SyncClient {
            requests: req_tx,
            notifications,
        }
    }

    async fn call(&self, event: ClientEvent) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Command(event, tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        check(rx.await.map_err(|_| ClientError::Stopped)?)
    }

    pub async fn connect(&self, endpoint: &str, timeout: Duration) -> Result<(), ClientError> {
        self.call(ClientEvent::Connect {
            endpoint: endpoint.to_string(),
            timeout,
        })
        .await
    }

    pub async fn set_inbox(&self, path: impl Into<PathBuf>) -> Result<(), ClientError> {
        self.call(ClientEvent::SetInbox(path.into())).await
    }

    pub async fn subscribe(&self, path: &str) -> Result<(), ClientError> {
        self.call(ClientEvent::Subscribe(path.to_string())).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.call(ClientEvent::Destructor).await
    }

    pub async fn connected(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Connected(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Next notification; `None` once the actor is gone and the stream is
    /// drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Say goodbye, wait until every notification produced so far is queued,
    /// and hand back whatever the caller has not read yet.
    pub async fn destroy(mut self) -> Vec<Notification> {
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "disconnect during destroy");
        }
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Flush(tx)).await.is_ok() && rx.await.is_err() {
            debug!("client stopped before flush");
        }
        drop(self.requests);
        let mut left = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            left.push(n);
        }
        left
    }
}
