//! Supervisor and forwarding pipeline
//!
//! The pipeline is the single-threaded core that sits between the upstream
//! decoder and the Kafka producer: it tracks in-flight transactions in the
//! ring, maps relations to topics, encodes and enqueues messages, applies
//! backpressure when the producer falls behind, and checkpoints the upstream
//! acknowledgement as deliveries drain. The supervisor loop alternates
//! between polling the upstream stream and polling the producer; all state
//! mutation happens between those explicit poll points, so nothing needs a
//! lock.

use crate::broker::{EnqueueOutcome, KafkaBroker, MessageBroker};
use crate::checkpoint::Checkpointer;
use crate::config::{BridgeConfig, ErrorPolicy};
use crate::encoder;
use crate::errors::{BridgeError, BridgeResult};
use crate::mapper::TableMapper;
use crate::registry::{HttpSchemaRegistry, SchemaRegistry};
use crate::source::decoder::Decoder;
use crate::source::snapshot;
use crate::source::stream::PgReplicationStream;
use crate::source::{ChangeHandler, Frame, StreamTransport};
use crate::tracker::TransactionRing;
use crate::types::{Delivery, Lsn, MessageEnvelope, Oid, SyncStatus, Xid, format_lsn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bounded wait while servicing producer callbacks under backpressure.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(200);
/// How long one upstream readiness wait may block.
const UPSTREAM_WAIT: Duration = Duration::from_millis(100);
/// Grace period for the producer to flush in-flight messages on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// How often an unsolicited status update is sent upstream.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle states of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initialising,
    Snapshotting,
    Streaming,
    Draining,
}

/// Opt-in observer invoked for every row handed to the producer. Used for
/// audit logging; not required for correctness.
pub trait RowObserver {
    fn observe(&mut self, relid: Oid, topic: &str, key: Option<&[u8]>, value: Option<&[u8]>, wal_pos: Lsn);
}

/// The forwarding pipeline. Implements [`ChangeHandler`], so the decoder
/// drives it directly.
pub struct Pipeline {
    config: BridgeConfig,
    // Declaration order fixes teardown order: mapper (and its registry)
    // before the upstream client, the broker client last.
    mapper: TableMapper,
    transport: Box<dyn StreamTransport>,
    broker: Box<dyn MessageBroker>,
    ring: TransactionRing,
    checkpointer: Checkpointer,
    shutdown: Arc<AtomicBool>,
    state: BridgeState,
    deliveries: Vec<Delivery>,
    last_status: Instant,
    row_observer: Option<Box<dyn RowObserver>>,
}

impl Pipeline {
    pub fn new(
        config: BridgeConfig,
        transport: Box<dyn StreamTransport>,
        broker: Box<dyn MessageBroker>,
        registry: Option<Box<dyn SchemaRegistry>>,
        shutdown: Arc<AtomicBool>,
        taking_snapshot: bool,
    ) -> Self {
        let mapper = TableMapper::new(registry, config.topic_prefix.clone());
        Self {
            config,
            mapper,
            transport,
            broker,
            ring: TransactionRing::new(),
            checkpointer: Checkpointer::new(taking_snapshot),
            shutdown,
            state: BridgeState::Initialising,
            deliveries: Vec::new(),
            last_status: Instant::now(),
            row_observer: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn snapshot_in_progress(&self) -> bool {
        self.checkpointer.snapshot_in_progress()
    }

    pub fn set_row_observer(&mut self, observer: Box<dyn RowObserver>) {
        self.row_observer = Some(observer);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Enters COPY BOTH mode on the transport and switches to streaming.
    pub fn begin_streaming(&mut self) -> BridgeResult<()> {
        self.transport.begin_streaming()?;
        self.state = BridgeState::Streaming;
        Ok(())
    }

    /// Applies the configured error policy to a policy-controlled failure:
    /// log it and continue, or make it fatal. The shutdown marker always
    /// propagates.
    fn handle_error(&mut self, err: BridgeError) -> BridgeResult<()> {
        if err.is_shutdown() {
            return Err(err);
        }
        match self.config.error_policy {
            ErrorPolicy::Log => {
                error!("{err}");
                Ok(())
            }
            ErrorPolicy::Exit => Err(err),
        }
    }

    /// Encodes and enqueues one row message on the transaction currently at
    /// the head of the ring.
    ///
    /// Queue-full outcomes loop through the backpressure routine and retry
    /// with the recovered envelope, so the message is enqueued at most once.
    /// The transaction's counters move only after a successful enqueue.
    fn send_message(
        &mut self,
        relid: Oid,
        wal_pos: Lsn,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> BridgeResult<()> {
        if self.ring.is_empty() {
            return Err(BridgeError::protocol(
                "row event received outside of a transaction",
            ));
        }

        let encoded = {
            let table = self.mapper.lookup(relid)?;
            encoder::encode_message(self.config.output_format, table, key, value)
                .map(|(encoded_key, encoded_value)| (table.topic.clone(), encoded_key, encoded_value))
        };
        let (topic, encoded_key, encoded_value) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => return self.handle_error(e),
        };

        let mut envelope = MessageEnvelope {
            slot: self.ring.head_index(),
            relid,
            wal_pos,
        };

        loop {
            match self.broker.enqueue(
                &topic,
                encoded_key.as_deref(),
                encoded_value.as_deref(),
                envelope,
            ) {
                EnqueueOutcome::Enqueued => break,
                EnqueueOutcome::QueueFull(returned) => {
                    envelope = returned;
                    debug!("producer queue is full, applying backpressure");
                    self.backpressure()?;
                }
                EnqueueOutcome::Rejected(_, reason) => {
                    return self.handle_error(BridgeError::broker(format!(
                        "failed to produce to topic {topic}: {reason}"
                    )));
                }
            }
        }

        self.ring.record_enqueue();
        if let Some(observer) = &mut self.row_observer {
            observer.observe(relid, &topic, key, value, wal_pos);
        }
        Ok(())
    }

    /// Keeps both ends healthy while something downstream is saturated:
    /// services producer callbacks for a bounded interval, honours a pending
    /// shutdown, and keeps the replication connection alive without
    /// consuming more data from it. Callers loop until their blocking
    /// precondition clears.
    fn backpressure(&mut self) -> BridgeResult<()> {
        self.poll_broker(BACKPRESSURE_POLL)?;

        if self.shutdown_requested() {
            info!("shutdown requested during backpressure");
            return Err(BridgeError::Shutdown);
        }

        self.send_status()
    }

    /// Polls the producer and applies every delivery notification that
    /// arrived.
    pub fn poll_broker(&mut self, timeout: Duration) -> BridgeResult<()> {
        let mut deliveries = std::mem::take(&mut self.deliveries);
        self.broker.poll(timeout, &mut deliveries);

        let mut result = Ok(());
        for delivery in deliveries.drain(..) {
            let applied = self.apply_delivery(delivery);
            // Keep consuming so later deliveries are not lost, but report the
            // first failure.
            if result.is_ok() {
                result = applied;
            }
        }
        self.deliveries = deliveries;
        result
    }

    /// Applies one delivery notification: account the acknowledgement on the
    /// owning transaction and let the checkpointer advance. A failed
    /// delivery under the log policy is treated as acknowledged so the tail
    /// of the ring cannot stall forever; under the exit policy it is fatal.
    fn apply_delivery(&mut self, delivery: Delivery) -> BridgeResult<()> {
        if let Some(reason) = &delivery.error {
            match self.config.error_policy {
                ErrorPolicy::Log => {
                    error!("{reason}; treating the message as acknowledged to avoid a stall");
                }
                ErrorPolicy::Exit => {
                    return Err(BridgeError::broker(reason.clone()));
                }
            }
        }

        self.ring.record_ack(delivery.envelope.slot);
        self.checkpointer.drain(&mut self.ring);
        Ok(())
    }

    fn send_status(&mut self) -> BridgeResult<()> {
        self.transport
            .send_status_update(self.checkpointer.fsync_lsn())?;
        self.last_status = Instant::now();
        Ok(())
    }

    fn maybe_send_status(&mut self) -> BridgeResult<()> {
        if self.last_status.elapsed() >= STATUS_INTERVAL {
            self.send_status()?;
        }
        Ok(())
    }

    /// Stops consuming upstream and gives the producer a bounded grace to
    /// deliver what is still in flight. Anything left undelivered has not
    /// been acknowledged upstream and replays on the next run.
    pub fn drain(&mut self) -> BridgeResult<()> {
        self.state = BridgeState::Draining;
        info!(
            "draining: {} message(s) in flight, acknowledged up to {}",
            self.broker.in_flight(),
            format_lsn(self.checkpointer.fsync_lsn())
        );

        let deadline = Instant::now() + DRAIN_GRACE;
        while self.broker.in_flight() > 0 && Instant::now() < deadline {
            self.poll_broker(Duration::from_millis(100))?;
        }
        if self.broker.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.broker.flush(remaining)?;
            self.poll_broker(Duration::ZERO)?;
        }

        let leftover = self.broker.in_flight();
        if leftover > 0 {
            warn!(
                "{leftover} message(s) still undelivered after the grace period; \
                 they will be replayed on restart"
            );
        }

        self.send_status()?;
        info!(
            "shut down with acknowledged position {}",
            format_lsn(self.checkpointer.fsync_lsn())
        );
        Ok(())
    }
}

impl ChangeHandler for Pipeline {
    fn on_begin(&mut self, xid: Xid, _wal_pos: Lsn) -> BridgeResult<()> {
        if xid == 0 {
            self.state = BridgeState::Snapshotting;
            info!("receiving initial snapshot as transaction 0");
        } else if self.checkpointer.snapshot_in_progress() && self.ring.is_empty() {
            // The slot was created with a pending snapshot that never ran.
            return Err(BridgeError::protocol(
                "expected snapshot to be the first transaction",
            ));
        }

        while self.ring.is_full() {
            debug!("too many transactions in flight, applying backpressure");
            self.backpressure()?;
        }
        self.ring.begin(xid)
    }

    fn on_commit(&mut self, xid: Xid, wal_pos: Lsn) -> BridgeResult<()> {
        self.ring.commit(xid, wal_pos)?;
        if xid == 0 {
            self.state = BridgeState::Streaming;
        }
        self.checkpointer.drain(&mut self.ring);
        Ok(())
    }

    fn on_table_schema(
        &mut self,
        relid: Oid,
        key_schema: Option<&str>,
        value_schema: &str,
        _wal_pos: Lsn,
    ) -> BridgeResult<()> {
        if key_schema.is_none() && !self.config.allow_unkeyed {
            return Err(BridgeError::config(format!(
                "relation {relid} has no replica identity key; updates and deletes \
                 cannot identify their row (use --allow-unkeyed to export it anyway)"
            )));
        }

        if let Err(e) = self.mapper.update(relid, key_schema, value_schema) {
            // Can't abort the decoder mid-frame; the policy decides whether
            // this run survives the failed registration.
            return self.handle_error(e);
        }
        Ok(())
    }

    fn on_insert(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        value: &[u8],
        wal_pos: Lsn,
    ) -> BridgeResult<()> {
        self.send_message(relid, wal_pos, key, Some(value))
    }

    fn on_update(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        _old: Option<&[u8]>,
        new: &[u8],
        wal_pos: Lsn,
    ) -> BridgeResult<()> {
        self.send_message(relid, wal_pos, key, Some(new))
    }

    fn on_delete(
        &mut self,
        relid: Oid,
        key: Option<&[u8]>,
        _old: Option<&[u8]>,
        wal_pos: Lsn,
    ) -> BridgeResult<()> {
        match key {
            // A keyed deletion becomes a tombstone for log compaction.
            Some(key) => self.send_message(relid, wal_pos, Some(key), None),
            // Without a key there is nothing downstream could correlate.
            None => Ok(()),
        }
    }

    fn on_keepalive(&mut self, wal_pos: Lsn) -> BridgeResult<SyncStatus> {
        if self.ring.is_empty() {
            self.checkpointer.observe_idle(wal_pos);
            Ok(SyncStatus::Clear)
        } else {
            Ok(SyncStatus::SyncPending)
        }
    }

    fn on_source_error(&mut self, message: &str) -> BridgeResult<()> {
        self.handle_error(BridgeError::connection(format!("client error: {message}")))
    }

    fn acknowledged_lsn(&self) -> Lsn {
        self.checkpointer.fsync_lsn()
    }
}

/// Owns the pipeline and the decoder and runs the supervisor loop.
pub struct Bridge {
    decoder: Decoder,
    pub pipeline: Pipeline,
}

impl Bridge {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            decoder: Decoder::new(),
            pipeline,
        }
    }

    /// Runs until the upstream ends, a fatal error occurs, or shutdown is
    /// requested; then drains. The shutdown marker is a clean exit.
    pub fn run(&mut self) -> BridgeResult<()> {
        match self.run_loop() {
            Ok(()) => self.pipeline.drain(),
            Err(e) if e.is_shutdown() => self.pipeline.drain(),
            Err(e) => Err(e),
        }
    }

    fn run_loop(&mut self) -> BridgeResult<()> {
        let Self { pipeline, decoder } = self;

        loop {
            if pipeline.shutdown_requested() {
                info!("shutdown signal received");
                return Ok(());
            }

            match pipeline.transport.poll_frame()? {
                Some(Frame::Keepalive {
                    wal_end,
                    reply_requested,
                }) => {
                    let status = pipeline.on_keepalive(wal_end)?;
                    debug!(
                        "keepalive at {}: {:?}",
                        format_lsn(wal_end),
                        status
                    );
                    if reply_requested {
                        pipeline.send_status()?;
                    }
                }
                Some(Frame::XLogData { wal_start, data }) => {
                    decoder.dispatch(wal_start, &data, pipeline)?;
                }
                None => {
                    pipeline.transport.wait_readable(UPSTREAM_WAIT)?;
                }
            }

            // Service delivery callbacks after every upstream poll.
            pipeline.poll_broker(Duration::ZERO)?;
            pipeline.maybe_send_status()?;
        }
    }
}

/// Wires the concrete collaborators together and runs the bridge to
/// completion. This is the one cleanup path: on a failure while the snapshot
/// was still in progress, the replication slot is dropped so the next run
/// restarts the snapshot from scratch.
pub fn run_bridge(config: BridgeConfig, shutdown: Arc<AtomicBool>) -> BridgeResult<()> {
    info!(
        "writing messages to Kafka in {} format",
        config.output_format.as_str()
    );

    let registry: Option<Box<dyn SchemaRegistry>> = match &config.registry_url {
        Some(url) => Some(Box::new(HttpSchemaRegistry::new(url)?)),
        None => None,
    };
    let broker = Box::new(KafkaBroker::connect(&config)?);

    let mut stream = PgReplicationStream::connect(&config)?;
    stream.identify_system()?;
    stream.create_slot()?;

    let snapshot = if stream.slot_created() && !config.skip_snapshot {
        stream
            .snapshot_name()
            .map(|name| (name.to_string(), stream.consistent_point()))
    } else {
        if stream.slot_created() {
            info!("skipping snapshot and streaming new changes only");
        }
        None
    };

    let pipeline = Pipeline::new(
        config.clone(),
        Box::new(stream),
        broker,
        registry,
        shutdown,
        snapshot.is_some(),
    );
    let mut bridge = Bridge::new(pipeline);

    let result = execute(&mut bridge, &config, snapshot);

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_shutdown() => Ok(()),
        Err(e) => {
            if bridge.pipeline.snapshot_in_progress() {
                info!("dropping replication slot since the snapshot did not complete successfully");
                if let Err(drop_err) = PgReplicationStream::drop_slot(&config) {
                    error!("could not drop replication slot: {drop_err}");
                }
            }
            Err(e)
        }
    }
}

fn execute(
    bridge: &mut Bridge,
    config: &BridgeConfig,
    snapshot: Option<(String, Lsn)>,
) -> BridgeResult<()> {
    if let Some((snapshot_name, consistent_point)) = snapshot {
        snapshot::stream_snapshot(
            config,
            &snapshot_name,
            consistent_point,
            &mut bridge.pipeline,
        )?;
    }
    bridge.pipeline.begin_streaming()?;
    bridge.run()
}
