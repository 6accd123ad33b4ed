//! Per-handle session state and the single-slot command mailbox.
//!
//! A `Session` is created when the host attaches an algorithm instance and lives until
//! it detaches (or its server stops). It holds three independently synchronized fields:
//!
//! - the latest `Quote`, overwritten by the host on every tick;
//! - the pending `Command`, deposited by the remote side and drained by the host;
//! - the response handoff, a one-slot channel the remote waiter blocks on.
//!
//! Every delivered command gets a sequence number. Host reads record which command the
//! host is looking at, and the response it posts carries that number, so a late answer
//! to a withdrawn command never reaches the waiter of a newer one.
//!
//! No lock here is ever held across another, so host-side and transport-side calls on
//! the same handle never block each other for longer than a field copy.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::debug;
use mt_common::{BridgeError, Command, NO_COMMAND, Quote, Response, Result};
use serde::Serialize;
use serde_json::Value;

/// Callback the host hands over on attach.
///
/// Invoked from the transport thread whenever a command lands in the session's mailbox,
/// so the host can wake up and poll instead of waiting for its next tick.
pub trait CommandSink: Send + Sync {
    /// A command is pending for `handle`.
    fn on_command(&self, handle: i32);
}

impl<F> CommandSink for F
where
    F: Fn(i32) + Send + Sync,
{
    fn on_command(&self, handle: i32) {
        self(handle)
    }
}

/// Point-in-time view of a session, for logging and inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Caller-assigned handle.
    pub handle: i32,
    /// Profile of the owning server.
    pub profile: String,
    /// Latest published quote.
    pub quote: Quote,
    /// Type of the pending command, `NO_COMMAND` if none.
    pub pending_command_type: i32,
    /// Attach time (UTC).
    pub attached_at: DateTime<Utc>,
}

#[derive(Default)]
struct Mailbox {
    last_seq: u64,
    // Sequence number of the command the host read last; 0 before any read.
    observed: u64,
    pending: Option<(u64, Command)>,
}

/// Session state for one attached algorithm instance.
pub struct Session {
    handle: i32,
    profile: String,
    attached_at: DateTime<Utc>,
    quote: Mutex<Quote>,
    mailbox: Mutex<Mailbox>,
    response_tx: Sender<(u64, Response)>,
    response_rx: Receiver<(u64, Response)>,
    sink: Mutex<Option<Arc<dyn CommandSink>>>,
    // Dropping the sender disconnects `closed_rx`, waking every remote waiter.
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    exchange: Mutex<()>,
}

// Field values are plain data, so a panic while holding one of these locks leaves
// nothing half-written worth refusing to read.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Creates an open session with an initial quote and the host's sink.
    pub fn new(handle: i32, profile: &str, quote: Quote, sink: Arc<dyn CommandSink>) -> Self {
        let (response_tx, response_rx) = bounded::<(u64, Response)>(1);
        let (closed_tx, closed_rx) = bounded::<()>(0);
        Self {
            handle,
            profile: String::from(profile),
            attached_at: Utc::now(),
            quote: Mutex::new(quote),
            mailbox: Mutex::new(Mailbox::default()),
            response_tx,
            response_rx,
            sink: Mutex::new(Some(sink)),
            closed_tx: Mutex::new(Some(closed_tx)),
            closed_rx,
            exchange: Mutex::new(()),
        }
    }

    /// Caller-assigned handle.
    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// Name of the profile whose server owns this session.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Copy of the latest quote.
    pub fn quote(&self) -> Quote {
        lock(&self.quote).clone()
    }

    /// Overwrites the quote (last write wins).
    pub fn set_quote(&self, quote: Quote) {
        *lock(&self.quote) = quote;
    }

    // Host-side read of the pending command; marks it as the one the next response answers.
    fn observe<R>(&self, read: impl FnOnce(&Command) -> R) -> Option<R> {
        let mut mailbox = lock(&self.mailbox);
        let (seq, value) = match &mailbox.pending {
            Some((seq, command)) => (*seq, read(command)),
            None => return None,
        };
        mailbox.observed = seq;
        Some(value)
    }

    /// Type of the pending command, or `NO_COMMAND` when the mailbox is empty.
    pub fn command_type(&self) -> i32 {
        self.observe(|cmd| cmd.command_type).unwrap_or(NO_COMMAND)
    }

    /// Parameter `index` of the pending command, if both exist.
    pub fn command_parameter(&self, index: i32) -> Option<Value> {
        self.observe(|cmd| cmd.parameter(index).cloned()).flatten()
    }

    // Drops the pending command if it is still `seq`.
    fn withdraw(&self, seq: u64) {
        let mut mailbox = lock(&self.mailbox);
        if mailbox.pending.as_ref().is_some_and(|(pending, _)| *pending == seq) {
            mailbox.pending = None;
        }
    }

    /// Snapshot of the session's fields. Each field is read independently, and reading
    /// the command type here does not count as a host read.
    pub fn info(&self) -> SessionInfo {
        let pending_command_type = lock(&self.mailbox)
            .pending
            .as_ref()
            .map_or(NO_COMMAND, |(_, cmd)| cmd.command_type);
        SessionInfo {
            handle: self.handle,
            profile: self.profile.clone(),
            quote: self.quote(),
            pending_command_type,
            attached_at: self.attached_at,
        }
    }

    /// Returns `true` once the session has been detached.
    pub fn is_closed(&self) -> bool {
        lock(&self.closed_tx).is_none()
    }

    fn detached(&self) -> BridgeError {
        BridgeError::Disconnected(format!("session {} is detached", self.handle))
    }

    /// Places `command` in the mailbox, wakes the host through its sink, and returns the
    /// command's sequence number.
    ///
    /// The slot always holds the latest command; a command that has not been answered
    /// yet is replaced.
    pub fn deliver_command(&self, command: Command) -> Result<u64> {
        if !command.is_valid() {
            return Err(BridgeError::InvalidCommand(format!(
                "command type {} is reserved",
                NO_COMMAND
            )));
        }
        if self.is_closed() {
            return Err(self.detached());
        }

        let command_type = command.command_type;
        let seq = {
            let mut mailbox = lock(&self.mailbox);
            mailbox.last_seq += 1;
            let seq = mailbox.last_seq;
            mailbox.pending = Some((seq, command));
            seq
        };
        // A concurrent close may have drained the mailbox before the store above.
        if self.is_closed() {
            self.withdraw(seq);
            return Err(self.detached());
        }
        debug!(
            "Session {}: command {} delivered as #{}",
            self.handle, command_type, seq
        );

        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.on_command(self.handle);
        }
        Ok(seq)
    }

    /// Answers the command the host read last: clears it from the command slot if it is
    /// still pending and fills the response slot.
    ///
    /// A response nobody collected yet is replaced.
    pub fn post_response(&self, response: Response) -> Result<()> {
        if self.is_closed() {
            return Err(self.detached());
        }

        let seq = {
            let mut mailbox = lock(&self.mailbox);
            let seq = mailbox.observed;
            if mailbox.pending.as_ref().is_some_and(|(pending, _)| *pending == seq) {
                mailbox.pending = None;
            }
            seq
        };
        while self.response_rx.try_recv().is_ok() {}
        self.response_tx
            .try_send((seq, response))
            .map_err(|e| BridgeError::ChannelSend(format!("session {}: {}", self.handle, e)))?;
        if self.is_closed() {
            while self.response_rx.try_recv().is_ok() {}
            return Err(self.detached());
        }
        debug!("Session {}: response to #{} posted", self.handle, seq);
        Ok(())
    }

    /// Takes the posted response, if any, without waiting.
    pub fn take_response(&self) -> Option<Response> {
        self.response_rx.try_recv().ok().map(|(_, response)| response)
    }

    /// Blocks until the response to command `seq` is posted, the session closes, or
    /// `timeout` elapses. Responses to other commands are discarded.
    pub fn wait_response(&self, seq: u64, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.response_rx) -> msg => {
                    let (answered, response) =
                        msg.map_err(|e| BridgeError::ChannelRecv(e.to_string()))?;
                    if answered == seq {
                        return Ok(response);
                    }
                    debug!(
                        "Session {}: dropping stale response to #{} while waiting for #{}",
                        self.handle, answered, seq
                    );
                }
                recv(self.closed_rx) -> _ => {
                    return Err(BridgeError::Disconnected(format!(
                        "session {} detached while waiting for a response",
                        self.handle
                    )));
                }
                default(remaining) => {
                    return Err(BridgeError::Timeout(format!(
                        "no response from session {} within {:?}",
                        self.handle, timeout
                    )));
                }
            }
        }
    }

    /// Remote-side round trip: deliver `command` and wait for its response.
    ///
    /// Exchanges on the same session are serialized. On timeout the command is withdrawn,
    /// and a late answer to it is dropped instead of being handed to the next exchange.
    pub fn exchange(&self, command: Command, timeout: Duration) -> Result<Response> {
        let _guard = lock(&self.exchange);
        while self.response_rx.try_recv().is_ok() {}

        let seq = self.deliver_command(command)?;
        let result = self.wait_response(seq, timeout);
        if result.is_err() {
            self.withdraw(seq);
        }
        result
    }

    /// Detaches the session: wakes remote waiters, drains both mailbox slots, and
    /// releases the sink. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let Some(closed_tx) = lock(&self.closed_tx).take() else {
            return false;
        };
        drop(closed_tx);

        lock(&self.mailbox).pending = None;
        while self.response_rx.try_recv().is_ok() {}
        lock(&self.sink).take();
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("profile", &self.profile)
            .field("attached_at", &self.attached_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn quiet_sink() -> Arc<dyn CommandSink> {
        Arc::new(|_: i32| {})
    }

    fn session() -> Session {
        Session::new(1, "profileA", Quote::new("EURUSD", 1.1, 1.2), quiet_sink())
    }

    #[test]
    fn empty_mailbox_reports_sentinel() {
        let s = session();
        assert_eq!(s.command_type(), NO_COMMAND);
        assert_eq!(s.command_parameter(0), None);
    }

    #[test]
    fn quote_is_last_write_wins() {
        let s = session();
        s.set_quote(Quote::new("GBPUSD", 1.3, 1.31));
        s.set_quote(Quote::new("EURUSD", 1.1, 1.2));
        assert_eq!(s.quote(), Quote::new("EURUSD", 1.1, 1.2));
    }

    #[test]
    fn delivered_command_is_visible_until_answered() {
        let s = session();
        s.deliver_command(Command::new(5, vec![json!(10), json!(20)])).unwrap();
        assert_eq!(s.command_type(), 5);
        assert_eq!(s.command_parameter(1), Some(json!(20)));
        assert_eq!(s.command_parameter(2), None);

        s.post_response(Response::new("ok")).unwrap();
        assert_eq!(s.command_type(), NO_COMMAND);
        assert_eq!(s.take_response(), Some(Response::new("ok")));
        assert_eq!(s.take_response(), None);
    }

    #[test]
    fn newer_command_replaces_pending_one() {
        let s = session();
        s.deliver_command(Command::new(1, Vec::new())).unwrap();
        s.deliver_command(Command::new(2, Vec::new())).unwrap();
        assert_eq!(s.command_type(), 2);
    }

    #[test]
    fn reserved_type_is_rejected() {
        let s = session();
        let err = s.deliver_command(Command::new(NO_COMMAND, Vec::new())).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCommand(_)));
    }

    #[test]
    fn sink_fires_on_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sink: Arc<dyn CommandSink> = Arc::new(move |handle: i32| {
            assert_eq!(handle, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let s = Session::new(7, "p", Quote::default(), sink);
        s.deliver_command(Command::new(3, Vec::new())).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exchange_returns_host_response() {
        let s = Arc::new(session());
        let host = Arc::clone(&s);
        let worker = thread::spawn(move || {
            loop {
                if host.command_type() == 5 {
                    let first = host.command_parameter(0).unwrap();
                    host.post_response(Response::new(first)).unwrap();
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        let response = s
            .exchange(Command::new(5, vec![json!(10)]), Duration::from_secs(5))
            .unwrap();
        worker.join().unwrap();
        assert_eq!(response.payload, json!(10));
        assert_eq!(s.take_response(), None);
    }

    #[test]
    fn exchange_times_out_and_withdraws_command() {
        let s = session();
        let err = s
            .exchange(Command::new(9, Vec::new()), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(s.command_type(), NO_COMMAND);
    }

    #[test]
    fn close_wakes_waiter_and_drains() {
        let s = Arc::new(session());
        let seq = s.deliver_command(Command::new(4, Vec::new())).unwrap();

        let waiter = Arc::clone(&s);
        let handle = thread::spawn(move || waiter.wait_response(seq, Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));

        assert!(s.close());
        assert!(!s.close());
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected(_)));
        assert_eq!(s.command_type(), NO_COMMAND);
        assert!(s.post_response(Response::new("late")).is_err());
        assert_eq!(s.take_response(), None);
        assert!(s.deliver_command(Command::new(1, Vec::new())).is_err());
    }

    fn wait_for_pending(s: &Session, command_type: i32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while s.info().pending_command_type != command_type {
            assert!(Instant::now() < deadline, "command {} never arrived", command_type);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn late_answer_is_not_handed_to_the_next_command() {
        let s = Arc::new(session());

        let remote = Arc::clone(&s);
        let first = thread::spawn(move || {
            remote.exchange(Command::new(1, Vec::new()), Duration::from_millis(500))
        });
        wait_for_pending(&s, 1);
        assert_eq!(s.command_type(), 1);
        let err = first.join().unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        let remote = Arc::clone(&s);
        let second = thread::spawn(move || {
            remote.exchange(Command::new(2, vec![json!("b")]), Duration::from_secs(5))
        });
        wait_for_pending(&s, 2);

        // The host finishes the first command only now.
        s.post_response(Response::new("first")).unwrap();
        assert_eq!(s.info().pending_command_type, 2);

        assert_eq!(s.command_type(), 2);
        assert_eq!(s.command_parameter(0), Some(json!("b")));
        s.post_response(Response::new("second")).unwrap();

        assert_eq!(second.join().unwrap().unwrap(), Response::new("second"));
        assert_eq!(s.command_type(), NO_COMMAND);
    }

    #[test]
    fn unobserved_replacement_keeps_newer_command() {
        let s = session();
        s.deliver_command(Command::new(1, Vec::new())).unwrap();
        assert_eq!(s.command_type(), 1);
        let newer = s.deliver_command(Command::new(2, Vec::new())).unwrap();

        s.post_response(Response::new("for 1")).unwrap();
        assert_eq!(s.info().pending_command_type, 2);
        let err = s.wait_response(newer, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }
}
