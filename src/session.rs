use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use ethers::types::H256;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    checkpoint::{CheckpointRecord, CheckpointStore},
    provider::ChainQuery,
    scanner::{ErrorKind, ScanError, Scanner},
    types::{Cursor, EventSink, WatchTarget},
    watch_config::{RetryPolicy, WatchConfig},
    Error,
};

/// Inputs that drive a session from one state to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    HeadTick,
    Flush,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopped,
}

/// Asks a running session to stop. The session notices at the top of its
/// loop, so a tick already in flight is allowed to finish first.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

/// One watch target's control loop: head ticks, checkpoint flushes and the
/// stop signal, served one at a time.
pub struct Session {
    scanner: Scanner,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn EventSink>,
    trigger_tx: Option<H256>,
    head_polling_interval: Duration,
    flush_interval: Duration,
    retry_policy: RetryPolicy,
    backoff: ExponentialBackoff,
    next_tick: Instant,
    state: SessionState,
    stop: watch::Receiver<bool>,
    heartbeat: watch::Sender<Option<u64>>,
}

impl Session {
    pub fn new(
        config: WatchConfig,
        chain: Arc<dyn ChainQuery>,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, StopHandle) {
        let target = WatchTarget {
            contract_address: config.contract_address,
            topics: config.decoder.topics(),
            start_block: config.start_block,
        };
        let scanner = Scanner::new(chain, target, config.decoder, sink.clone());
        let (stop_sender, stop) = watch::channel(false);
        let (heartbeat, _) = watch::channel(scanner.cursor().last_scanned_block());

        let session = Self {
            scanner,
            store,
            sink,
            trigger_tx: config.trigger_tx,
            head_polling_interval: config.head_polling_interval,
            flush_interval: config.flush_interval,
            retry_policy: config.retry_policy,
            backoff: config.retry_policy.backoff(),
            next_tick: Instant::now(),
            state: SessionState::Running,
            stop,
            heartbeat,
        };
        let handle = StopHandle {
            sender: Arc::new(stop_sender),
        };
        (session, handle)
    }

    pub fn target(&self) -> &WatchTarget {
        self.scanner.target()
    }

    pub fn cursor(&self) -> Cursor {
        self.scanner.cursor()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Liveness signal: the last scanned block, published before every tick.
    /// A supervisor that stops seeing updates should treat the session as
    /// stalled.
    pub fn heartbeat(&self) -> watch::Receiver<Option<u64>> {
        self.heartbeat.subscribe()
    }

    /// Seeds the cursor and runs the trigger transaction check, if any.
    /// Only a permanent failure is returned; transient ones are retried.
    pub async fn start(&mut self) -> Result<(), Error> {
        let seed = self.scanner.seed(self.store.as_ref()).await;
        self.heartbeat
            .send_replace(self.scanner.cursor().last_scanned_block());

        let Some(tx_hash) = self.trigger_tx else {
            return Ok(());
        };
        let mut backoff = self.retry_policy.backoff();
        loop {
            if *self.stop.borrow() {
                return Ok(());
            }
            match self.scanner.check_trigger_transaction(tx_hash, seed).await {
                Ok(events) => {
                    tracing::info!(
                        contract = ?self.target().contract_address,
                        events,
                        "trigger transaction checked"
                    );
                    return Ok(());
                }
                Err(error) if error.kind() == ErrorKind::Permanent => {
                    return Err(self.fail(error));
                }
                Err(error) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.retry_policy.max_interval);
                    tracing::warn!(
                        contract = ?self.target().contract_address,
                        "trigger transaction check failed, retrying after {delay:?}: {error}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Handles a single control event.
    pub async fn handle(&mut self, event: ControlEvent) -> Result<SessionState, Error> {
        if self.state == SessionState::Stopped {
            return Ok(SessionState::Stopped);
        }

        match event {
            ControlEvent::HeadTick => self.on_head_tick().await?,
            ControlEvent::Flush => self.flush().await,
            ControlEvent::Stop => {
                tracing::info!(
                    contract = ?self.target().contract_address,
                    "stop signal received"
                );
                self.flush().await;
                self.sink
                    .on_stopped(self.target().contract_address)
                    .await;
                self.state = SessionState::Stopped;
            }
        }
        Ok(self.state)
    }

    /// Runs until stopped or until a permanent error. Returns the final cursor.
    pub async fn run(mut self) -> Result<Cursor, Error> {
        self.start().await?;

        let mut flush_timer =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_armed = true;

        while self.state == SessionState::Running {
            let event = tokio::select! {
                biased;

                changed = self.stop.changed(), if stop_armed => match changed {
                    Ok(()) if *self.stop.borrow() => ControlEvent::Stop,
                    Ok(()) => continue,
                    Err(_) => {
                        // all stop handles dropped
                        stop_armed = false;
                        continue;
                    }
                },
                _ = tokio::time::sleep_until(self.next_tick) => ControlEvent::HeadTick,
                _ = flush_timer.tick() => ControlEvent::Flush,
            };
            self.handle(event).await?;
        }

        tracing::info!(
            contract = ?self.target().contract_address,
            last_scanned_block = self.cursor().last_scanned_block(),
            "watch session stopped"
        );
        Ok(self.cursor())
    }

    async fn on_head_tick(&mut self) -> Result<(), Error> {
        self.heartbeat
            .send_replace(self.scanner.cursor().last_scanned_block());

        match self.scanner.tick().await {
            Ok(_) => {
                self.backoff.reset();
                self.next_tick = Instant::now() + self.head_polling_interval;
                self.heartbeat
                    .send_replace(self.scanner.cursor().last_scanned_block());
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::Permanent => Err(self.fail(error)),
            Err(error) => {
                let delay = self
                    .backoff
                    .next_backoff()
                    .unwrap_or(self.retry_policy.max_interval);
                tracing::warn!(
                    contract = ?self.target().contract_address,
                    "tick failed, retrying after {delay:?}: {error}"
                );
                self.next_tick = Instant::now() + delay;
                Ok(())
            }
        }
    }

    fn fail(&self, error: ScanError) -> Error {
        tracing::error!(
            contract = ?self.target().contract_address,
            "permanent failure, ending session: {error}"
        );
        Error::Session {
            contract_address: self.target().contract_address,
            source: error,
        }
    }

    /// Saves the current cursor. Failures are logged; the next flush retries.
    async fn flush(&self) {
        let contract = self.target().contract_address;
        let Some(block) = self.cursor().last_scanned_block() else {
            tracing::debug!(
                contract = ?contract,
                "nothing scanned yet, skipping checkpoint"
            );
            return;
        };

        let record = CheckpointRecord::new(contract, block);
        match self.store.save(&record).await {
            Ok(()) => tracing::info!(contract = ?contract, block, "checkpoint flushed"),
            Err(error) => tracing::error!(
                contract = ?contract,
                block,
                "could not flush checkpoint, will retry on next flush: {error}"
            ),
        }
    }
}
