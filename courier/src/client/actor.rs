//! The client task: one owner for all delivery state.
//!
//! Commands from [`super::Courier`] handles, transport events from the open
//! and reader tasks, and timer expirations all arrive on channels and are
//! handled one at a time by [`Actor::run`]. Nothing outside this task
//! touches the connection, tracker, or queue.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::CourierConfig;
use crate::connection::{Connection, ConnectionError, ConnectionState, ReconnectPolicy, Transition};
use crate::delivery::{Delivery, DeliveryError, DeliveryTracker};
use crate::dispatch::{DispatchError, EventDispatcher, StateChange};
use crate::heartbeat::HeartbeatMonitor;
use crate::queue::OfflineQueue;
use crate::stats::{ConnectionStats, StatsCollector};
use crate::timers::{TimerFired, TimerKey, TimerRegistry};
use crate::transport::{Transport, TransportError};

use super::{Command, ConnectError, PendingCounts};

/// Something that happened on the transport, tagged with the epoch of the
/// session it belongs to.
#[derive(Debug)]
pub(super) enum Event {
    /// An open attempt finished.
    Opened {
        epoch: u64,
        result: Result<(), TransportError>,
    },
    /// The reader received a frame.
    Inbound { epoch: u64, bytes: Vec<u8> },
    /// The reader saw the connection end.
    Closed { epoch: u64, error: TransportError },
}

/// Channels created alongside the actor.
pub(super) struct ActorParts {
    pub(super) state: watch::Receiver<ConnectionState>,
    pub(super) stats: watch::Receiver<ConnectionStats>,
    pub(super) events: mpsc::UnboundedReceiver<Event>,
    pub(super) timers: mpsc::UnboundedReceiver<TimerFired>,
    pub(super) dispatch_errors: mpsc::UnboundedReceiver<DispatchError>,
}

pub(super) struct Actor<T: Transport> {
    pub(super) transport: Arc<T>,
    pub(super) config: CourierConfig,
    pub(super) policy: ReconnectPolicy,
    pub(super) connection: Connection,
    pub(super) tracker: DeliveryTracker,
    pub(super) queue: OfflineQueue<Delivery>,
    pub(super) heartbeat: HeartbeatMonitor,
    pub(super) dispatcher: EventDispatcher,
    pub(super) stats: StatsCollector,
    pub(super) timers: TimerRegistry,
    pub(super) state_tx: watch::Sender<ConnectionState>,
    pub(super) events_tx: mpsc::UnboundedSender<Event>,
    pub(super) reader: Option<JoinHandle<()>>,
    pub(super) connect_waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    pub(super) next_seq: u64,
}

impl<T: Transport> Actor<T> {
    pub(super) fn new(transport: Arc<T>, config: CourierConfig) -> (Self, ActorParts) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timers, timers_rx) = TimerRegistry::new();
        let (dispatcher, dispatch_errors) = EventDispatcher::new();
        let stats = StatsCollector::new();
        let stats_rx = stats.subscribe();

        let actor = Self {
            transport,
            policy: config.reconnect_policy(),
            connection: Connection::new(),
            tracker: DeliveryTracker::new(),
            queue: OfflineQueue::new(config.offline_queue_capacity),
            heartbeat: HeartbeatMonitor::new(config.ping_interval, config.heartbeat_timeout),
            dispatcher,
            stats,
            timers,
            state_tx,
            events_tx,
            reader: None,
            connect_waiters: Vec::new(),
            next_seq: 0,
            config,
        };
        let parts = ActorParts {
            state: state_rx,
            stats: stats_rx,
            events: events_rx,
            timers: timers_rx,
            dispatch_errors,
        };
        (actor, parts)
    }

    /// Event loop. Returns when a shutdown command arrives or every handle
    /// has been dropped.
    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        tracing::debug!(transport = %self.transport.transport_type(), "client task started");
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.handle_event(event).await,
                Some(fired) = fired.recv() => self.handle_timer(fired).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }
        tracing::debug!("client task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send { message, reply } => self.submit(message, reply).await,
            Command::SubscribeMessages { handler, reply } => {
                let _ = reply.send(self.dispatcher.subscribe_messages(handler));
            }
            Command::SubscribeState { handler, reply } => {
                let _ = reply.send(self.dispatcher.subscribe_state(handler));
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.dispatcher.unsubscribe(id));
            }
            Command::Pending { reply } => {
                let _ = reply.send(PendingCounts {
                    in_flight: self.tracker.len(),
                    queued: self.queue.len(),
                });
            }
            Command::Reset { reply } => {
                self.disconnect().await;
                self.reject_all(&DeliveryError::Shutdown);
                let before = self.stats.reset();
                tracing::info!("client reset");
                let _ = reply.send(before);
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop; kept for exhaustiveness.
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { epoch, result } => self.on_opened(epoch, result).await,
            Event::Inbound { epoch, bytes } => {
                if self.is_current(epoch) {
                    self.on_inbound(&bytes).await;
                } else {
                    tracing::debug!(epoch, "dropping frame from superseded connection");
                }
            }
            Event::Closed { epoch, error } => {
                if self.is_current(epoch) {
                    self.connection_lost(ConnectionError::TransportLost(error.to_string()))
                        .await;
                }
            }
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.fire(fired) {
            return;
        }
        match fired.key {
            TimerKey::Connect => {}
            TimerKey::Reconnect => {
                if self.connection.state() == ConnectionState::Reconnecting {
                    self.stats.record_reconnect_attempt();
                    tracing::info!(
                        attempt = self.connection.attempt_count(),
                        max_attempts = self.policy.max_attempts,
                        "reconnecting"
                    );
                    self.start_attempt();
                }
            }
            TimerKey::Heartbeat => self.send_heartbeat().await,
            TimerKey::HeartbeatTimeout => {
                if self.heartbeat.is_awaiting() {
                    tracing::warn!(
                        timeout_ms = self.heartbeat.timeout().as_millis(),
                        "no heartbeat reply, treating connection as dead"
                    );
                    self.connection_lost(ConnectionError::HeartbeatTimeout).await;
                }
            }
            TimerKey::AckTimeout(key) => self.ack_timeout(key).await,
        }
    }

    /// Whether events tagged `epoch` belong to the live connection.
    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.connection.epoch() && self.connection.state() == ConnectionState::Connected
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    fn connect(&mut self, reply: oneshot::Sender<Result<(), ConnectError>>) {
        match self.connection.state() {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.connect_waiters.push(reply),
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Error => {
                self.timers.cancel(TimerKey::Reconnect);
                self.connection.reset_attempts();
                self.connect_waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    /// Enter CONNECTING and open the transport on a separate task, bounded
    /// by the connection timeout.
    pub(super) fn start_attempt(&mut self) {
        let previous = self.connection.state();
        let current = match self.connection.begin_attempt() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "cannot start connection attempt");
                return;
            }
        };
        self.stats.record_connect_attempt();

        let epoch = self.connection.epoch();
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let timeout = self.config.connection_timeout;
        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transport.open())
                .await
                .unwrap_or(Err(TransportError::Timeout));
            let _ = events.send(Event::Opened { epoch, result });
        });
        self.timers.track(TimerKey::Connect, task.abort_handle());

        tracing::debug!(epoch, "connection attempt started");
        self.publish(previous, current, None);
    }

    async fn on_opened(&mut self, epoch: u64, result: Result<(), TransportError>) {
        if epoch != self.connection.epoch()
            || self.connection.state() != ConnectionState::Connecting
        {
            tracing::debug!(epoch, "ignoring result of superseded connection attempt");
            return;
        }
        self.timers.forget(TimerKey::Connect);

        match result {
            Ok(()) => {
                let previous = self.connection.state();
                let current = match self.connection.opened(std::time::Instant::now()) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot enter connected state");
                        return;
                    }
                };
                self.stats.record_connected();
                tracing::info!(epoch, "connected");

                self.spawn_reader(epoch);
                self.heartbeat.reset();
                self.timers
                    .schedule(TimerKey::Heartbeat, self.heartbeat.interval());
                self.publish(previous, current, None);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.drain_queue().await;
            }
            Err(e) => {
                let error = match e {
                    TransportError::Timeout => ConnectionError::Timeout,
                    other => ConnectionError::TransportLost(other.to_string()),
                };
                tracing::warn!(epoch, error = %error, "connection attempt failed");
                self.close_transport().await;
                self.attempt_failed(error);
            }
        }
    }

    fn attempt_failed(&mut self, error: ConnectionError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Failed(error.clone())));
        }
        match self.connection.next_retry(&self.policy) {
            Some(delay) => {
                self.transition(Transition::Failed, Some(error.clone()));
                self.transition(Transition::Retry, Some(error));
                tracing::info!(
                    delay_ms = delay.as_millis(),
                    attempt = self.connection.attempt_count(),
                    "scheduling reconnect"
                );
                self.timers.schedule(TimerKey::Reconnect, delay);
            }
            None => self.give_up(),
        }
    }

    /// Tear down the live connection after a close, write error, or
    /// heartbeat timeout, then schedule a reconnect.
    pub(super) async fn connection_lost(&mut self, error: ConnectionError) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        tracing::warn!(error = %error, "connection lost");
        self.stop_session().await;
        self.requeue_in_flight();
        self.stats.record_disconnect();

        match self.connection.next_retry(&self.policy) {
            Some(delay) => {
                self.transition(Transition::Lost, Some(error));
                tracing::info!(delay_ms = delay.as_millis(), "scheduling reconnect");
                self.timers.schedule(TimerKey::Reconnect, delay);
            }
            None => self.give_up(),
        }
    }

    fn give_up(&mut self) {
        let error = ConnectionError::ReconnectExhausted {
            attempts: self.connection.attempt_count(),
        };
        tracing::error!(
            attempts = self.connection.attempt_count(),
            queued = self.queue.len(),
            "reconnect attempts exhausted"
        );
        self.transition(Transition::Fatal, Some(error));
    }

    /// Stop the heartbeat and reader, close the transport, and move to a new
    /// epoch so late events from this session are ignored.
    async fn stop_session(&mut self) {
        self.timers.cancel(TimerKey::Heartbeat);
        self.timers.cancel(TimerKey::HeartbeatTimeout);
        self.heartbeat.reset();
        self.stop_reader().await;
        self.close_transport().await;
        self.connection.invalidate();
    }

    /// Close the transport, bounded like any other write.
    async fn close_transport(&mut self) {
        let limit = self.config.write_timeout;
        if tokio::time::timeout(limit, self.transport.close()).await.is_err() {
            tracing::warn!(timeout_ms = limit.as_millis(), "transport close timed out");
        }
    }

    async fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            // Wait for the task to drop so it releases the transport's read half.
            let _ = reader.await;
        }
    }

    fn spawn_reader(&mut self, epoch: u64) {
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(bytes) => {
                        if events.send(Event::Inbound { epoch, bytes }).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = events.send(Event::Closed { epoch, error });
                        break;
                    }
                }
            }
        }));
    }

    /// Caller-initiated teardown. Idempotent.
    pub(super) async fn disconnect(&mut self) {
        let previous = self.connection.state();
        if previous == ConnectionState::Disconnected {
            return;
        }
        self.timers.cancel_all();
        self.heartbeat.reset();
        self.stop_reader().await;
        self.close_transport().await;
        if previous == ConnectionState::Connected {
            self.stats.record_disconnect();
        }
        self.requeue_in_flight();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }
        let current = self.connection.disconnected();
        tracing::info!(queued = self.queue.len(), "disconnected");
        self.publish(previous, current, None);
    }

    async fn teardown(&mut self) {
        self.disconnect().await;
        self.reject_all(&DeliveryError::Shutdown);
        self.timers.cancel_all();
    }

    /// Reject every queued and in-flight delivery.
    fn reject_all(&mut self, error: &DeliveryError) {
        let in_flight = self.tracker.drain_in_send_order();
        let count = in_flight.len() + self.queue.len();
        for (key, waiter) in in_flight {
            self.timers.cancel(TimerKey::AckTimeout(key));
            waiter.delivery.reject(error.clone());
        }
        for delivery in self.queue.drain() {
            delivery.reject(error.clone());
        }
        if count > 0 {
            tracing::info!(count, error = %error, "rejected pending messages");
        }
    }

    // -----------------------------------------------------------------------
    // State publication
    // -----------------------------------------------------------------------

    fn transition(&mut self, transition: Transition, error: Option<ConnectionError>) {
        let previous = self.connection.state();
        match self.connection.apply(transition) {
            Ok(current) => self.publish(previous, current, error),
            Err(e) => tracing::error!(error = %e, "state machine rejected transition"),
        }
    }

    fn publish(
        &mut self,
        previous: ConnectionState,
        current: ConnectionState,
        error: Option<ConnectionError>,
    ) {
        if previous == current {
            return;
        }
        tracing::info!(%previous, %current, "connection state changed");
        self.state_tx.send_replace(current);
        self.dispatcher.dispatch_state(&StateChange {
            previous,
            current,
            error,
        });
    }
}
