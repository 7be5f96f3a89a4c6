use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelEvent, ChannelEventKind, ChannelState, Connection, Connector, ReconnectPolicy};
use crate::config::ChannelConfig;
use crate::error::{ChannelSendError, TransportError};
use crate::types::{Message, PushFrame};

/// Commands from the handle to the channel task.
#[derive(Debug)]
enum ChannelCommand {
    Send {
        text: String,
        respond_to: oneshot::Sender<Result<(), ChannelSendError>>,
    },
}

/// Handle to the push connection for one conversation.
///
/// The connection itself lives in a spawned task that owns the socket and
/// the reconnect timer; the handle only holds channels into it. Dropping the
/// handle cancels the task.
pub struct TransportChannel<C: Connector> {
    connector: Arc<C>,
    url: String,
    conversation_id: String,
    config: ChannelConfig,
    events: mpsc::Sender<ChannelEvent>,
    running: Option<Running>,
}

struct Running {
    commands: mpsc::Sender<ChannelCommand>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<C: Connector> TransportChannel<C> {
    /// Create an idle channel. Nothing connects until `connect()`.
    pub fn new(
        connector: Arc<C>,
        url: String,
        conversation_id: &str,
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            connector,
            url,
            conversation_id: conversation_id.to_string(),
            config,
            events,
            running: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        match &self.running {
            Some(running) => *running.state.borrow(),
            None => ChannelState::Idle,
        }
    }

    /// Watch state transitions of the current run, if any.
    pub fn watch_state(&self) -> Option<watch::Receiver<ChannelState>> {
        self.running.as_ref().map(|r| r.state.clone())
    }

    /// Start the connection task. No-op while a task is already running.
    pub fn connect(&mut self) {
        if let Some(running) = &self.running {
            if !running.task.is_finished() {
                return;
            }
        }

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        let cancel = CancellationToken::new();

        let task = ChannelTask {
            connector: self.connector.clone(),
            url: self.url.clone(),
            conversation_id: self.conversation_id.clone(),
            policy: self.config.reconnect,
            events: self.events.clone(),
            commands: commands_rx,
            state: state_tx,
            cancel: cancel.clone(),
        };

        debug!(conversation_id = %self.conversation_id, "starting push channel");
        let task = tokio::spawn(task.run());
        self.running = Some(Running {
            commands: commands_tx,
            state: state_rx,
            cancel,
            task,
        });
    }

    /// Send a text frame. Only valid while `Open`.
    pub async fn send(&self, text: String) -> Result<(), ChannelSendError> {
        let Some(running) = &self.running else {
            return Err(ChannelSendError::NotConnected);
        };
        if *running.state.borrow() != ChannelState::Open {
            return Err(ChannelSendError::NotConnected);
        }

        let (respond_to, rx) = oneshot::channel();
        running
            .commands
            .send(ChannelCommand::Send { text, respond_to })
            .await
            .map_err(|_| ChannelSendError::NotConnected)?;
        rx.await.unwrap_or(Err(ChannelSendError::NotConnected))
    }

    /// Stop reconnecting, close the socket if open, and wait for the task to
    /// finish. The channel ends `Idle`.
    pub async fn disconnect(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(conversation_id = %self.conversation_id, error = %e, "push channel task failed");
        }
        info!(conversation_id = %self.conversation_id, "push channel disconnected");
    }
}

impl<C: Connector> Drop for TransportChannel<C> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

enum Attempt<T> {
    Connected(T),
    Failed(TransportError),
    Cancelled,
}

enum Served {
    Dropped,
    Cancelled,
}

enum Forwarded {
    Delivered,
    WriteFailed,
    Cancelled,
}

enum Step {
    Cancelled,
    Command(Option<ChannelCommand>),
    Frame(Option<Result<String, TransportError>>),
}

struct ChannelTask<C: Connector> {
    connector: Arc<C>,
    url: String,
    conversation_id: String,
    policy: ReconnectPolicy,
    events: mpsc::Sender<ChannelEvent>,
    commands: mpsc::Receiver<ChannelCommand>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
}

impl<C: Connector> ChannelTask<C> {
    async fn run(mut self) {
        // Failures since the last successful open, for backoff
        let mut failures: u32 = 0;

        loop {
            self.set_state(ChannelState::Connecting);
            match self.open_connection().await {
                Attempt::Cancelled => break,
                Attempt::Failed(e) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        attempt = failures + 1,
                        error = %e,
                        "push channel connect failed"
                    );
                }
                Attempt::Connected(conn) => {
                    failures = 0;
                    self.set_state(ChannelState::Open);
                    info!(conversation_id = %self.conversation_id, "push channel open");
                    match self.serve(conn).await {
                        Served::Cancelled => break,
                        Served::Dropped => {
                            info!(conversation_id = %self.conversation_id, "push channel dropped");
                        }
                    }
                }
            }

            self.set_state(ChannelState::Closed);
            let delay = self.policy.delay(failures);
            failures = failures.saturating_add(1);
            self.set_state(ChannelState::ReconnectWait);
            debug!(
                conversation_id = %self.conversation_id,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect"
            );
            if !self.wait(delay).await {
                break;
            }
        }

        self.set_state(ChannelState::Idle);
        debug!(conversation_id = %self.conversation_id, "push channel stopped");
    }

    async fn open_connection(&mut self) -> Attempt<C::Conn> {
        let connect = self.connector.connect(&self.url);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Attempt::Cancelled,
                result = &mut connect => {
                    return match result {
                        Ok(conn) => Attempt::Connected(conn),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                Some(cmd) = self.commands.recv() => reject(cmd),
            }
        }
    }

    async fn serve(&mut self, mut conn: C::Conn) -> Served {
        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                cmd = self.commands.recv() => Step::Command(cmd),
                frame = conn.recv() => Step::Frame(frame),
            };

            match step {
                // A closed command queue means the handle is gone
                Step::Cancelled | Step::Command(None) => {
                    conn.close().await;
                    return Served::Cancelled;
                }
                Step::Command(Some(ChannelCommand::Send { text, respond_to })) => {
                    if !self.write(&mut conn, text, respond_to).await {
                        return Served::Dropped;
                    }
                }
                Step::Frame(None) => return Served::Dropped,
                Step::Frame(Some(Err(e))) => {
                    warn!(conversation_id = %self.conversation_id, error = %e, "push channel read failed");
                    return Served::Dropped;
                }
                Step::Frame(Some(Ok(text))) => {
                    let Some(message) = self.parse_push(&text) else {
                        continue;
                    };
                    match self.forward(&mut conn, message).await {
                        Forwarded::Delivered => {}
                        Forwarded::WriteFailed => return Served::Dropped,
                        Forwarded::Cancelled => {
                            conn.close().await;
                            return Served::Cancelled;
                        }
                    }
                }
            }
        }
    }

    /// Write one outbound frame and answer the caller. Returns `false` if the
    /// connection is broken.
    async fn write(
        &self,
        conn: &mut C::Conn,
        text: String,
        respond_to: oneshot::Sender<Result<(), ChannelSendError>>,
    ) -> bool {
        match conn.send(text).await {
            Ok(()) => {
                let _ = respond_to.send(Ok(()));
                true
            }
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "push channel write failed");
                let _ = respond_to.send(Err(ChannelSendError::Transport(e)));
                false
            }
        }
    }

    /// Parse one inbound frame. Only `message` frames yield a value.
    fn parse_push(&self, text: &str) -> Option<Message> {
        let frame: PushFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "dropping malformed push frame");
                return None;
            }
        };

        if frame.frame_type != PushFrame::MESSAGE {
            debug!(frame_type = %frame.frame_type, "ignoring push frame");
            return None;
        }

        match serde_json::from_value(frame.data) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "dropping push with malformed message");
                None
            }
        }
    }

    /// Hand a pushed message to the engine.
    ///
    /// The event queue is bounded, so this can wait on a busy engine. Send
    /// commands are still served meanwhile: the engine may be the one
    /// waiting on a send reply.
    async fn forward(&mut self, conn: &mut C::Conn, message: Message) -> Forwarded {
        let event = ChannelEvent {
            conversation_id: self.conversation_id.clone(),
            kind: ChannelEventKind::Message(message),
        };
        let delivery = self.events.send(event);
        tokio::pin!(delivery);
        let mut write_failed = false;

        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => return Forwarded::Cancelled,
                // A dropped receiver means the engine moved on; nothing to deliver to
                _ = &mut delivery => break,
                cmd = self.commands.recv() => cmd,
            };
            let Some(ChannelCommand::Send { text, respond_to }) = cmd else {
                return Forwarded::Cancelled;
            };
            if write_failed {
                let _ = respond_to.send(Err(ChannelSendError::NotConnected));
            } else if !self.write(conn, text, respond_to).await {
                // Keep the pending push; reconnect once it is delivered
                write_failed = true;
            }
        }

        if write_failed {
            Forwarded::WriteFailed
        } else {
            Forwarded::Delivered
        }
    }

    /// Sleep out the reconnect delay. Returns `false` if cancelled.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                Some(cmd) = self.commands.recv() => reject(cmd),
            }
        }
    }

    /// Publish a state. The watch always holds the latest value. The event
    /// queue copy is skipped when the queue is full; the engine reconciles
    /// against the watch after every event it handles.
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
        let event = ChannelEvent {
            conversation_id: self.conversation_id.clone(),
            kind: ChannelEventKind::State(state),
        };
        if self.events.try_send(event).is_err() {
            debug!(conversation_id = %self.conversation_id, %state, "channel state event not queued");
        }
    }
}

fn reject(cmd: ChannelCommand) {
    match cmd {
        ChannelCommand::Send { respond_to, .. } => {
            let _ = respond_to.send(Err(ChannelSendError::NotConnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeConnector, push_frame};

    fn fixed(secs: u64) -> ChannelConfig {
        ChannelConfig {
            reconnect: ReconnectPolicy::Fixed {
                delay: Duration::from_secs(secs),
            },
            event_capacity: 64,
        }
    }

    fn new_channel(
        connector: &FakeConnector,
        config: ChannelConfig,
    ) -> (TransportChannel<FakeConnector>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity);
        let channel = TransportChannel::new(
            Arc::new(connector.clone()),
            "ws://fake/ws/c1/tok".into(),
            "c1",
            config,
            tx,
        );
        (channel, rx)
    }

    async fn wait_for(state: &mut watch::Receiver<ChannelState>, want: ChannelState) {
        state.wait_for(|s| *s == want).await.unwrap();
    }

    async fn next_message(events: &mut mpsc::Receiver<ChannelEvent>) -> Message {
        loop {
            let event = events.recv().await.unwrap();
            assert_eq!(event.conversation_id, "c1");
            if let ChannelEventKind::Message(m) = event.kind {
                return m;
            }
        }
    }

    #[tokio::test]
    async fn starts_idle_and_send_is_rejected() {
        let connector = FakeConnector::new();
        let (channel, _events) = new_channel(&connector, fixed(5));
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(matches!(
            channel.send("x".into()).await,
            Err(ChannelSendError::NotConnected)
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn connects_and_forwards_message_pushes() {
        let connector = FakeConnector::new();
        let (mut channel, mut events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        peer.push(push_frame("m2", "next?"));
        let msg = next_message(&mut events).await;
        assert_eq!(msg.id, "m2");
        assert_eq!(msg.question.as_deref(), Some("next?"));

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_skipped() {
        let connector = FakeConnector::new();
        let (mut channel, mut events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        peer.push("not json".to_string());
        peer.push(r#"{"type": "notification", "data": {"message": "bye"}}"#.to_string());
        peer.push(r#"{"type": "message", "data": {"question": 7}}"#.to_string());
        peer.push(push_frame("m3", "still alive"));

        let msg = next_message(&mut events).await;
        assert_eq!(msg.id, "m3");
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(connector.attempts(), 1);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let connector = FakeConnector::new();
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let mut peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        channel.send("frame-1".into()).await.unwrap();
        assert_eq!(peer.sent().await.as_deref(), Some("frame-1"));

        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_drop_within_one_wait_window() {
        let connector = FakeConnector::new();
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        let dropped_at = tokio::time::Instant::now();
        drop(peer);
        wait_for(&mut state, ChannelState::ReconnectWait).await;
        assert!(matches!(
            channel.send("x".into()).await,
            Err(ChannelSendError::NotConnected)
        ));

        let _peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;
        let waited = dropped_at.elapsed();
        assert!(waited >= Duration::from_secs(5), "reconnected too early: {waited:?}");
        assert!(waited < Duration::from_secs(10), "reconnected too late: {waited:?}");
        assert_eq!(connector.attempts(), 2);

        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_keep_retrying() {
        let connector = FakeConnector::new();
        connector.refuse_next(3);
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();

        let _peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;
        assert_eq!(connector.attempts(), 4);

        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = FakeConnector::new();
        connector.refuse_next(1);
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        wait_for(&mut state, ChannelState::ReconnectWait).await;

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1, "no attempts after disconnect");
    }

    #[tokio::test]
    async fn disconnect_closes_open_connection() {
        let connector = FakeConnector::new();
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let mut peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Idle);
        // Client side of the fake connection is gone
        assert!(peer.sent().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_starts_fresh() {
        let connector = FakeConnector::new();
        let (mut channel, _events) = new_channel(&connector, fixed(5));
        channel.connect();
        let _first = connector.next_peer().await;
        channel.disconnect().await;

        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let _second = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;
        assert_eq!(connector.attempts(), 2);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn state_transitions_are_reported_as_events() {
        let connector = FakeConnector::new();
        let (mut channel, mut events) = new_channel(&connector, fixed(5));
        channel.connect();
        let _peer = connector.next_peer().await;

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if let ChannelEventKind::State(s) = event.kind {
                seen.push(s);
                if s == ChannelState::Open {
                    break;
                }
            }
        }
        assert_eq!(seen, vec![ChannelState::Connecting, ChannelState::Open]);

        channel.disconnect().await;
    }

    #[tokio::test]
    async fn sends_are_served_while_the_event_queue_is_full() {
        let connector = FakeConnector::new();
        let config = ChannelConfig {
            event_capacity: 1,
            ..fixed(5)
        };
        let (mut channel, mut events) = new_channel(&connector, config);
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let mut peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        // Nobody reads events, so the task parks on a pending push
        for i in 0..5 {
            peer.push(push_frame(&format!("m{i}"), "queued"));
        }
        tokio::task::yield_now().await;

        let sent = tokio::time::timeout(Duration::from_secs(5), channel.send("frame-1".into()))
            .await
            .expect("send must not wait on event delivery");
        assert!(sent.is_ok());
        assert_eq!(peer.sent().await.as_deref(), Some("frame-1"));

        let mut ids = Vec::new();
        while ids.len() < 5 {
            ids.push(next_message(&mut events).await.id);
        }
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(channel.state(), ChannelState::Open);

        channel.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_while_push_is_pending_drops_the_connection() {
        let connector = FakeConnector::new();
        let config = ChannelConfig {
            event_capacity: 1,
            ..fixed(5)
        };
        let (mut channel, mut events) = new_channel(&connector, config);
        channel.connect();
        let mut state = channel.watch_state().unwrap();
        let peer = connector.next_peer().await;
        wait_for(&mut state, ChannelState::Open).await;

        peer.push(push_frame("m1", "first"));
        tokio::task::yield_now().await;
        peer.fail_sends();

        assert!(matches!(
            channel.send("frame-1".into()).await,
            Err(ChannelSendError::Transport(_))
        ));
        // The pending push still goes out before the reconnect
        assert_eq!(next_message(&mut events).await.id, "m1");
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        wait_for(&mut state, ChannelState::ReconnectWait).await;

        channel.disconnect().await;
    }
}
