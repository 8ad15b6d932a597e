//! File-sync client engine: connect, subscribe, then apply streamed patches
//! under credit-based flow control.
//!
//! The engine is a (state, event) table. Universal events (SRSLY, RTFM,
//! HUGZ_OK and the two bombs) are handled the same way in every state before
//! the table is consulted. An action may raise an exception event, which
//! skips the remaining actions and the state change and is then processed in
//! the current state.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use crate::fmq::{Cheezburger, FmqMessage, Operation};
use crate::inbox::Inbox;
use crate::peer::TransportError;

pub const CREDIT_SLICE: i64 = 1_000_000;
pub const CREDIT_MINIMUM: i64 = 4 * CREDIT_SLICE + 1;
/// Consecutive expiries tolerated while connecting or subscribing.
pub const MAX_HANDSHAKE_TIMEOUTS: u32 = 3;

const SERVER_NOT_REACHABLE: &str = "server is not reachable";

/// Point-to-point channel to the file server, supplied by the host.
pub trait ServerLink {
    fn connect(&mut self, endpoint: &str) -> Result<(), TransportError>;
    fn send(&mut self, msg: &FmqMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Start => "start",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Subscribing => "subscribing",
            State::Subscribed => "subscribed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect { endpoint: String, timeout: Duration },
    ConnectError(String),
    OhaiOk,
    Expired,
    SetInbox(PathBuf),
    Subscribe(String),
    Destructor,
    SubscribeError(String),
    IcanhazOk,
    SendCredit,
    Cheezburger(Cheezburger),
    Finished,
    Srsly(String),
    Rtfm(String),
    HugzOk,
    /// Abort, answered on the command channel.
    BombCmd,
    /// Abort, reported as an asynchronous notification.
    BombMsg,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::ConnectError(_) => "connect_error",
            Event::OhaiOk => "ohai_ok",
            Event::Expired => "expired",
            Event::SetInbox(_) => "set_inbox",
            Event::Subscribe(_) => "subscribe",
            Event::Destructor => "destructor",
            Event::SubscribeError(_) => "subscribe_error",
            Event::IcanhazOk => "icanhaz_ok",
            Event::SendCredit => "send_credit",
            Event::Cheezburger(_) => "cheezburger",
            Event::Finished => "finished",
            Event::Srsly(_) => "srsly",
            Event::Rtfm(_) => "rtfm",
            Event::HugzOk => "hugz_ok",
            Event::BombCmd => "bombcmd",
            Event::BombMsg => "bombmsg",
        }
    }

    /// Events that come from the caller and owe it a reply.
    fn is_command(&self) -> bool {
        matches!(
            self,
            Event::Connect { .. } | Event::SetInbox(_) | Event::Subscribe(_) | Event::Destructor
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    FileUpdated { inbox: PathBuf, filename: String },
    FileDeleted { inbox: PathBuf, filename: String },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutput {
    Reply(Reply),
    Notify(Notification),
}

/// Result of one transition: the next event to run, or an exception.
type Step = Result<Option<Event>, Event>;

pub struct ClientEngine<L: ServerLink> {
    link: L,
    state: State,
    stopped: bool,
    connected: bool,
    awaiting_reply: bool,
    log_prefix: String,
    timeout: Option<Duration>,
    timeouts: u32,
    inbox: Option<Inbox>,
    subscriptions: Vec<String>,
    /// Credit the server may still spend.
    credit: i64,
    credit_to_send: u64,
    granted: u64,
    applied: u64,
    noms_sent: u64,
}

impl<L: ServerLink> ClientEngine<L> {
    pub fn new(link: L) -> Self {
        let log_prefix = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        ClientEngine {
            link,
            state: State::Start,
            stopped: false,
            connected: false,
            awaiting_reply: false,
            log_prefix,
            timeout: None,
            timeouts: 0,
            inbox: None,
            subscriptions: Vec::new(),
            credit: 0,
            credit_to_send: 0,
            granted: 0,
            applied: 0,
            noms_sent: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Reply timeout the host should arm after every event; `None` until a
    /// connect has been issued.
    pub fn timeout(&self) -> Option<Duration> {
        if self.stopped {
            None
        } else {
            self.timeout
        }
    }

    pub fn credit(&self) -> i64 {
        self.credit
    }

    /// Total credit ever granted to the server.
    pub fn granted(&self) -> u64 {
        self.granted
    }

    /// Total bytes debited for applied chunks.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn inbox(&self) -> Option<&std::path::Path> {
        self.inbox.as_ref().map(Inbox::root)
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Map an inbound server message onto the event table.
    pub fn on_message(&mut self, msg: FmqMessage) -> Vec<ClientOutput> {
        trace!(prefix = %self.log_prefix, command = msg.command(), "recv");
        self.timeouts = 0;
        let event = match msg {
            FmqMessage::OhaiOk => Event::OhaiOk,
            FmqMessage::IcanhazOk => Event::IcanhazOk,
            FmqMessage::Cheezburger(c) => Event::Cheezburger(c),
            FmqMessage::HugzOk => Event::HugzOk,
            FmqMessage::Srsly { reason } => Event::Srsly(reason),
            FmqMessage::Rtfm { reason } => Event::Rtfm(reason),
            other => {
                error!(prefix = %self.log_prefix, command = other.command(), "unknown command from server, halting");
                let mut out = Vec::new();
                if !self.stopped {
                    self.terminate(format!("unexpected {} from server", other.command()), &mut out);
                }
                return out;
            }
        };
        self.handle(event)
    }

    /// Run `event` and everything it raises to completion.
    pub fn handle(&mut self, event: Event) -> Vec<ClientOutput> {
        let mut out = Vec::new();
        if self.stopped {
            if event.is_command() {
                out.push(ClientOutput::Reply(Reply::Failure("client terminated".into())));
            }
            return out;
        }
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if event.is_command() {
                self.awaiting_reply = true;
            }
            debug!(prefix = %self.log_prefix, state = %self.state, event = event.name(), "event");
            next = match self.execute(event, &mut out) {
                Ok(next) => next,
                Err(exception) => {
                    debug!(prefix = %self.log_prefix, exception = exception.name(), "exception");
                    Some(exception)
                }
            };
            if self.stopped {
                break;
            }
        }
        out
    }

    fn execute(&mut self, event: Event, out: &mut Vec<ClientOutput>) -> Step {
        match event {
            Event::Srsly(reason) => {
                self.timeouts = 0;
                warn!(prefix = %self.log_prefix, %reason, "access was denied");
                self.terminate(reason, out);
                return Ok(None);
            }
            Event::Rtfm(reason) => {
                self.timeouts = 0;
                error!(prefix = %self.log_prefix, %reason, "invalid message");
                self.terminate(reason, out);
                return Ok(None);
            }
            Event::HugzOk => {
                self.timeouts = 0;
                return Ok(None);
            }
            Event::BombCmd => {
                self.reply(Reply::Failure(SERVER_NOT_REACHABLE.into()), out);
                self.terminate(SERVER_NOT_REACHABLE.into(), out);
                return Ok(None);
            }
            Event::BombMsg => {
                out.push(ClientOutput::Notify(Notification::Disconnected {
                    reason: SERVER_NOT_REACHABLE.into(),
                }));
                self.terminate(SERVER_NOT_REACHABLE.into(), out);
                return Ok(None);
            }
            _ => {}
        }

        match (self.state, event) {
            (State::Start, Event::Connect { endpoint, timeout }) => {
                if let Err(e) = self.link.connect(&endpoint) {
                    warn!(prefix = %self.log_prefix, %endpoint, error = %e, "could not connect");
                    return Err(Event::ConnectError(format!(
                        "unable to connect to {endpoint}: {e}"
                    )));
                }
                self.timeout = Some(timeout);
                if let Err(e) = self.link.send(&FmqMessage::ohai()) {
                    return Err(Event::ConnectError(format!("OHAI not sent: {e}")));
                }
                self.state = State::Connecting;
                Ok(None)
            }
            (State::Start, Event::ConnectError(reason)) => {
                warn!(prefix = %self.log_prefix, %reason, "unable to connect to the server");
                self.reply(Reply::Failure(reason), out);
                Ok(None)
            }

            (State::Connecting, Event::OhaiOk) => {
                self.timeouts = 0;
                self.connected = true;
                info!(prefix = %self.log_prefix, "connected to server");
                self.reply(Reply::Success, out);
                self.state = State::Connected;
                Ok(None)
            }
            (State::Connecting, Event::Expired) => {
                if self.handshake_timeout() {
                    warn!(prefix = %self.log_prefix, "server did not respond to the request to communicate");
                    return Ok(Some(Event::BombCmd));
                }
                Ok(None)
            }

            (State::Connected, Event::SetInbox(path)) => {
                if self.inbox.is_some() {
                    self.reply(Reply::Failure("inbox already set".into()), out);
                } else {
                    debug!(prefix = %self.log_prefix, inbox = %path.display(), "inbox set");
                    self.inbox = Some(Inbox::new(path));
                    self.reply(Reply::Success, out);
                }
                Ok(None)
            }
            (State::Connected, Event::Subscribe(path)) => {
                if self.inbox.is_none() {
                    error!(prefix = %self.log_prefix, "can't subscribe without inbox set");
                    return Err(Event::SubscribeError(
                        "can't subscribe without inbox set".into(),
                    ));
                }
                if !path.starts_with('/') {
                    error!(prefix = %self.log_prefix, %path, "subscription path must start with /");
                    return Err(Event::SubscribeError(format!(
                        "unable to subscribe path {path}, must start with /"
                    )));
                }
                if self.subscriptions.contains(&path) {
                    warn!(prefix = %self.log_prefix, %path, "already subscribed");
                    self.reply(Reply::Success, out);
                    return Ok(None);
                }
                self.subscriptions.push(path.clone());
                let icanhaz = FmqMessage::Icanhaz {
                    path,
                    options: Default::default(),
                    cache: Default::default(),
                };
                self.send(&icanhaz)?;
                self.state = State::Subscribing;
                Ok(None)
            }
            (State::Connected | State::Subscribing, Event::SubscribeError(reason)) => {
                self.reply(Reply::Failure(reason), out);
                Ok(None)
            }
            (State::Connected | State::Subscribed, Event::Destructor) => {
                self.send(&FmqMessage::Kthxbai)?;
                self.reply(Reply::Success, out);
                self.terminate_quietly();
                Ok(None)
            }
            (State::Connected | State::Subscribed, Event::Expired) => {
                self.timeouts = self.timeouts.saturating_add(1);
                trace!(prefix = %self.log_prefix, timeouts = self.timeouts, "idle, sending HUGZ");
                self.send(&FmqMessage::Hugz)?;
                Ok(None)
            }

            (State::Subscribing, Event::IcanhazOk) => {
                self.timeouts = 0;
                self.reply(Reply::Success, out);
                let next = self.refill_credit();
                self.state = State::Subscribed;
                Ok(next)
            }
            (State::Subscribing, Event::Expired) => {
                if self.handshake_timeout() {
                    warn!(prefix = %self.log_prefix, "server did not respond to subscription request");
                    return Ok(Some(Event::BombCmd));
                }
                Ok(None)
            }

            (State::Subscribed, Event::SendCredit) => {
                let nom = FmqMessage::Nom {
                    credit: self.credit_to_send,
                    sequence: self.noms_sent,
                };
                self.send(&nom)?;
                self.noms_sent += 1;
                self.credit_to_send = 0;
                Ok(None)
            }
            (State::Subscribed, Event::Cheezburger(patch)) => {
                self.timeouts = 0;
                self.process_the_patch(&patch, out);
                Ok(self.refill_credit())
            }
            (State::Subscribed, Event::Finished) => Ok(self.refill_credit()),

            (state, event) => {
                error!(prefix = %self.log_prefix, %state, event = event.name(), "protocol error");
                if self.awaiting_reply {
                    self.reply(
                        Reply::Failure(format!("{} not allowed while {}", event.name(), state)),
                        out,
                    );
                }
                Ok(None)
            }
        }
    }

    /// Count an expiry during a handshake phase; true once the limit is hit.
    fn handshake_timeout(&mut self) -> bool {
        self.timeouts += 1;
        self.timeouts >= MAX_HANDSHAKE_TIMEOUTS
    }

    fn send(&mut self, msg: &FmqMessage) -> Result<(), Event> {
        trace!(prefix = %self.log_prefix, command = msg.command(), "send");
        self.link.send(msg).map_err(|e| {
            warn!(prefix = %self.log_prefix, command = msg.command(), error = %e, "send failed");
            Event::BombMsg
        })
    }

    fn reply(&mut self, reply: Reply, out: &mut Vec<ClientOutput>) {
        if !self.awaiting_reply {
            debug!(prefix = %self.log_prefix, ?reply, "no command pending, reply dropped");
            return;
        }
        self.awaiting_reply = false;
        out.push(ClientOutput::Reply(reply));
    }

    /// Stop the engine. A command still waiting is failed with `reason`;
    /// otherwise the caller hears about it asynchronously.
    fn terminate(&mut self, reason: String, out: &mut Vec<ClientOutput>) {
        if self.awaiting_reply {
            self.reply(Reply::Failure(reason), out);
        } else if self.connected
            && !out
                .iter()
                .any(|o| matches!(o, ClientOutput::Notify(Notification::Disconnected { .. })))
        {
            out.push(ClientOutput::Notify(Notification::Disconnected { reason }));
        }
        self.terminate_quietly();
    }

    fn terminate_quietly(&mut self) {
        info!(prefix = %self.log_prefix, state = %self.state, "terminating");
        self.stopped = true;
        self.connected = false;
    }

    /// Top the balance up to the minimum in whole slices. Raises SEND_CREDIT
    /// when anything was granted.
    fn refill_credit(&mut self) -> Option<Event> {
        let mut added = 0u64;
        while self.credit < CREDIT_MINIMUM {
            self.credit += CREDIT_SLICE;
            added += CREDIT_SLICE as u64;
        }
        if added == 0 {
            return None;
        }
        self.credit_to_send += added;
        self.granted += added;
        Some(Event::SendCredit)
    }

    fn matching_subscription(&self, filename: &str) -> Option<&str> {
        self.subscriptions
            .iter()
            .map(String::as_str)
            .find(|sub| {
                filename == *sub
                    || sub.ends_with('/') && filename.starts_with(sub)
                    || filename
                        .strip_prefix(sub)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    fn process_the_patch(&mut self, patch: &Cheezburger, out: &mut Vec<ClientOutput>) {
        let filename = patch.filename.as_str();
        if !filename.starts_with('/') {
            error!(prefix = %self.log_prefix, %filename, "filename did not start with a '/'");
            return;
        }
        let Some(sub) = self.matching_subscription(filename) else {
            debug!(prefix = %self.log_prefix, %filename, "subscription not found");
            return;
        };
        let rest = &filename[sub.len()..];
        let rel = match rest.strip_prefix('/').unwrap_or(rest) {
            // subscribed to the file itself
            "" => filename.rsplit('/').next().unwrap_or_default().to_string(),
            rel => rel.to_string(),
        };
        let prefix = self.log_prefix.clone();
        let Some(inbox) = self.inbox.as_mut() else {
            return;
        };
        let root = inbox.root().to_path_buf();

        if let Operation::Create = patch.operation {
            if !patch.chunk.is_empty() {
                let len = patch.chunk.len() as u64;
                self.credit -= len as i64;
                self.applied += len;
            }
        }
        if let Err(e) = inbox.resolve(&rel) {
            warn!(prefix = %prefix, error = %e, "patch dropped");
            return;
        }

        match patch.operation {
            Operation::Create if !patch.chunk.is_empty() => {
                if let Err(e) = inbox.write(&rel, patch.offset, &patch.chunk) {
                    warn!(prefix = %prefix, error = %e, "unable to write, patch dropped");
                }
            }
            Operation::Create => match inbox.close(&rel) {
                Ok(()) => {
                    debug!(prefix = %prefix, file = %rel, "file complete");
                    out.push(ClientOutput::Notify(Notification::FileUpdated {
                        inbox: root,
                        filename: rel,
                    }));
                }
                Err(e) => warn!(prefix = %prefix, error = %e, "unable to finish file"),
            },
            Operation::Delete => {
                if let Err(e) = inbox.remove(&rel) {
                    warn!(prefix = %prefix, error = %e, "unable to delete");
                }
                debug!(prefix = %prefix, file = %rel, "file deleted");
                out.push(ClientOutput::Notify(Notification::FileDeleted {
                    inbox: root,
                    filename: rel,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Headers;
    use std::fs;

    #[derive(Default)]
    struct Link {
        sent: Vec<FmqMessage>,
        refuse_connect: bool,
        refuse_send: bool,
    }

    impl ServerLink for Link {
        fn connect(&mut self, _endpoint: &str) -> Result<(), TransportError> {
            if self.refuse_connect {
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        fn send(&mut self, msg: &FmqMessage) -> Result<(), TransportError> {
            if self.refuse_send {
                return Err(TransportError::WouldBlock);
            }
            self.sent.push(msg.clone());
            Ok(())
        }
    }

    fn connect_cmd() -> Event {
        Event::Connect {
            endpoint: "tcp://10.0.0.1:5670".into(),
            timeout: Duration::from_secs(1),
        }
    }

    fn sent(engine: &mut ClientEngine<Link>) -> Vec<FmqMessage> {
        std::mem::take(&mut engine.link_mut().sent)
    }

    fn success() -> Vec<ClientOutput> {
        vec![ClientOutput::Reply(Reply::Success)]
    }

    fn failure(reason: &str) -> Vec<ClientOutput> {
        vec![ClientOutput::Reply(Reply::Failure(reason.into()))]
    }

    fn connected() -> ClientEngine<Link> {
        let mut c = ClientEngine::new(Link::default());
        assert!(c.handle(connect_cmd()).is_empty());
        assert_eq!(c.state(), State::Connecting);
        assert_eq!(c.timeout(), Some(Duration::from_secs(1)));
        assert_eq!(sent(&mut c), vec![FmqMessage::ohai()]);
        assert_eq!(c.on_message(FmqMessage::OhaiOk), success());
        assert_eq!(c.state(), State::Connected);
        assert!(c.connected());
        c
    }

    fn subscribed(inbox: &std::path::Path, path: &str) -> ClientEngine<Link> {
        let mut c = connected();
        assert_eq!(c.handle(Event::SetInbox(inbox.to_path_buf())), success());
        assert!(c.handle(Event::Subscribe(path.into())).is_empty());
        assert_eq!(c.state(), State::Subscribing);
        assert_eq!(
            sent(&mut c),
            vec![FmqMessage::Icanhaz {
                path: path.into(),
                options: Headers::new(),
                cache: Headers::new(),
            }]
        );
        assert_eq!(c.on_message(FmqMessage::IcanhazOk), success());
        assert_eq!(c.state(), State::Subscribed);
        c
    }

    fn patch(filename: &str, operation: Operation, offset: u64, chunk: &[u8]) -> FmqMessage {
        FmqMessage::Cheezburger(Cheezburger {
            sequence: 0,
            operation,
            filename: filename.into(),
            offset,
            eof: chunk.is_empty(),
            headers: Headers::new(),
            chunk: chunk.to_vec(),
        })
    }

    fn assert_ledger(c: &ClientEngine<Link>) {
        assert_eq!(c.granted() as i64 - c.applied() as i64, c.credit());
    }

    #[test]
    fn subscribe_grants_initial_credit() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        assert_eq!(
            sent(&mut c),
            vec![FmqMessage::Nom {
                credit: 5 * CREDIT_SLICE as u64,
                sequence: 0
            }]
        );
        assert_eq!(c.credit(), 5 * CREDIT_SLICE);
        assert_ledger(&c);
    }

    #[test]
    fn file_arrives_in_chunks_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/docs");
        sent(&mut c);
        assert!(c
            .on_message(patch("/docs/a.txt", Operation::Create, 0, b"hello "))
            .is_empty());
        assert!(c
            .on_message(patch("/docs/a.txt", Operation::Create, 6, b"world"))
            .is_empty());
        let out = c.on_message(patch("/docs/a.txt", Operation::Create, 11, b""));
        assert_eq!(
            out,
            vec![ClientOutput::Notify(Notification::FileUpdated {
                inbox: dir.path().to_path_buf(),
                filename: "a.txt".into(),
            })]
        );
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello world");
        assert_eq!(c.applied(), 11);
        // still above the minimum, nothing granted
        assert!(sent(&mut c).is_empty());
        assert_ledger(&c);
    }

    #[test]
    fn finished_tops_up_only_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        sent(&mut c);
        assert!(c.handle(Event::Finished).is_empty());
        assert!(sent(&mut c).is_empty());

        // balance spent without a chunk reaching the refill path
        c.credit -= 2 * CREDIT_SLICE;
        c.applied += 2 * CREDIT_SLICE as u64;
        assert!(c.handle(Event::Finished).is_empty());
        assert_eq!(
            sent(&mut c),
            vec![FmqMessage::Nom {
                credit: 2 * CREDIT_SLICE as u64,
                sequence: 1
            }]
        );
        assert_eq!(c.credit(), 5 * CREDIT_SLICE);
        assert_ledger(&c);
    }

    #[test]
    fn finished_outside_subscription_is_ignored() {
        let mut c = connected();
        assert!(c.handle(Event::Finished).is_empty());
        assert_eq!(c.state(), State::Connected);
        assert!(sent(&mut c).is_empty());
    }

    #[test]
    fn delete_removes_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/old.bin"), b"x").unwrap();
        let mut c = subscribed(dir.path(), "/");
        let out = c.on_message(patch("/sub/old.bin", Operation::Delete, 0, b""));
        assert_eq!(
            out,
            vec![ClientOutput::Notify(Notification::FileDeleted {
                inbox: dir.path().to_path_buf(),
                filename: "sub/old.bin".into(),
            })]
        );
        assert!(!dir.path().join("sub/old.bin").exists());
    }

    #[test]
    fn large_chunk_triggers_refill() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        sent(&mut c);
        let chunk = vec![7u8; 1_500_000];
        assert!(c
            .on_message(patch("/big", Operation::Create, 0, &chunk))
            .is_empty());
        assert_eq!(
            sent(&mut c),
            vec![FmqMessage::Nom {
                credit: CREDIT_SLICE as u64,
                sequence: 1
            }]
        );
        assert_eq!(c.credit(), 4_500_000);
        assert!(c.credit() >= CREDIT_MINIMUM);
        assert_ledger(&c);
    }

    #[test]
    fn patches_outside_subscription_or_inbox_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/docs");
        assert!(c
            .on_message(patch("/docsmore/x", Operation::Create, 0, b""))
            .is_empty());
        assert!(c
            .on_message(patch("no-slash", Operation::Create, 0, b""))
            .is_empty());
        assert!(c
            .on_message(patch("/docs/../../etc/x", Operation::Create, 0, b"evil"))
            .is_empty());
        assert!(c
            .on_message(patch("/docs/../../etc/x", Operation::Delete, 0, b""))
            .is_empty());
        assert!(!dir.path().join("docsmore").exists());
        assert_eq!(c.state(), State::Subscribed);
        assert_ledger(&c);
    }

    #[test]
    fn subscribing_to_a_file_lands_under_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/docs/a.txt");
        c.on_message(patch("/docs/a.txt", Operation::Create, 0, b"1"));
        let out = c.on_message(patch("/docs/a.txt", Operation::Create, 1, b""));
        assert_eq!(out.len(), 1);
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"1");
    }

    #[test]
    fn three_handshake_timeouts_abort() {
        let mut c = ClientEngine::new(Link::default());
        c.handle(connect_cmd());
        assert!(c.handle(Event::Expired).is_empty());
        assert!(c.handle(Event::Expired).is_empty());
        assert_eq!(c.handle(Event::Expired), failure(SERVER_NOT_REACHABLE));
        assert!(c.is_stopped());
        assert_eq!(c.timeout(), None);
        assert_eq!(c.handle(connect_cmd()), failure("client terminated"));
    }

    #[test]
    fn server_traffic_resets_timeout_count() {
        let mut c = ClientEngine::new(Link::default());
        c.handle(connect_cmd());
        c.handle(Event::Expired);
        c.handle(Event::Expired);
        assert!(c.on_message(FmqMessage::HugzOk).is_empty());
        c.handle(Event::Expired);
        c.handle(Event::Expired);
        assert!(!c.is_stopped());
        assert_eq!(c.state(), State::Connecting);
    }

    #[test]
    fn subscription_timeouts_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = connected();
        c.handle(Event::SetInbox(dir.path().to_path_buf()));
        c.handle(Event::Subscribe("/".into()));
        c.handle(Event::Expired);
        c.handle(Event::Expired);
        assert_eq!(c.handle(Event::Expired), failure(SERVER_NOT_REACHABLE));
        assert!(c.is_stopped());
    }

    #[test]
    fn idle_session_keeps_sending_hugz() {
        let mut c = connected();
        for _ in 0..5 {
            assert!(c.handle(Event::Expired).is_empty());
        }
        assert_eq!(sent(&mut c), vec![FmqMessage::Hugz; 5]);
        assert!(!c.is_stopped());
    }

    #[test]
    fn connect_failure_is_reported_and_retryable() {
        let mut c = ClientEngine::new(Link {
            refuse_connect: true,
            ..Link::default()
        });
        let out = c.handle(connect_cmd());
        assert!(matches!(&out[..], [ClientOutput::Reply(Reply::Failure(r))] if r.contains("unable to connect")));
        assert_eq!(c.state(), State::Start);
        assert!(!c.is_stopped());
        c.link_mut().refuse_connect = false;
        assert!(c.handle(connect_cmd()).is_empty());
        assert_eq!(c.state(), State::Connecting);
    }

    #[test]
    fn inbox_and_subscribe_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = connected();
        assert_eq!(
            c.handle(Event::Subscribe("/".into())),
            failure("can't subscribe without inbox set")
        );
        assert_eq!(c.handle(Event::SetInbox(dir.path().to_path_buf())), success());
        assert_eq!(
            c.handle(Event::SetInbox(dir.path().to_path_buf())),
            failure("inbox already set")
        );
        assert_eq!(
            c.handle(Event::Subscribe("docs".into())),
            failure("unable to subscribe path docs, must start with /")
        );
        assert_eq!(c.state(), State::Connected);
        assert!(sent(&mut c).is_empty());
    }

    #[test]
    fn unexpected_events_leave_state_alone() {
        let mut c = connected();
        assert!(c.handle(Event::IcanhazOk).is_empty());
        assert!(c.handle(Event::SendCredit).is_empty());
        assert_eq!(c.state(), State::Connected);
        // a pending command is still answered
        let out = c.handle(connect_cmd());
        assert!(matches!(&out[..], [ClientOutput::Reply(Reply::Failure(_))]));
        assert_eq!(c.state(), State::Connected);
        assert!(!c.is_stopped());
    }

    #[test]
    fn refusal_fails_pending_subscribe() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = connected();
        c.handle(Event::SetInbox(dir.path().to_path_buf()));
        c.handle(Event::Subscribe("/".into()));
        let out = c.on_message(FmqMessage::Srsly {
            reason: "access denied".into(),
        });
        assert_eq!(out, failure("access denied"));
        assert!(c.is_stopped());
        assert!(!c.connected());
    }

    #[test]
    fn refusal_while_idle_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        let out = c.on_message(FmqMessage::Rtfm {
            reason: "bad nom".into(),
        });
        assert_eq!(
            out,
            vec![ClientOutput::Notify(Notification::Disconnected {
                reason: "bad nom".into()
            })]
        );
        assert!(c.is_stopped());
    }

    #[test]
    fn send_failure_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        c.link_mut().refuse_send = true;
        let out = c.handle(Event::Expired);
        assert_eq!(
            out,
            vec![ClientOutput::Notify(Notification::Disconnected {
                reason: SERVER_NOT_REACHABLE.into()
            })]
        );
        assert!(c.is_stopped());
    }

    #[test]
    fn destructor_says_goodbye() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = subscribed(dir.path(), "/");
        sent(&mut c);
        assert_eq!(c.handle(Event::Destructor), success());
        assert_eq!(sent(&mut c), vec![FmqMessage::Kthxbai]);
        assert!(c.is_stopped());
        assert!(c.handle(Event::Expired).is_empty());
    }

    #[test]
    fn unexpected_server_command_terminates() {
        let mut c = connected();
        let out = c.on_message(FmqMessage::Kthxbai);
        assert!(matches!(
            &out[..],
            [ClientOutput::Notify(Notification::Disconnected { .. })]
        ));
        assert!(c.is_stopped());
    }
}
