use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::hub::Hub;

/// Codes carried on a worker's control channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StopSignal {
    /// Producer reports it is exiting
    Ack = 0,
    /// TTL elapsed
    Timeout = 1,
    /// Group has no members left
    Idle = 2,
    /// Explicit stop or release
    Requested = 3,
}

impl StopSignal {
    pub fn code(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopSignal::Ack => "ack",
            StopSignal::Timeout => "timeout",
            StopSignal::Idle => "idle",
            StopSignal::Requested => "requested",
        };
        write!(f, "{}({})", name, self.code())
    }
}

const MIN_IDLE_INTERVAL: Duration = Duration::from_millis(1);

/// Supervisor timing knobs.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// How often an empty group is checked for
    pub idle_interval: Duration,
    /// How long a producer gets to exit after a stop request
    pub grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            grace: Duration::from_secs(3),
        }
    }
}

/// The producer's end of its control channels.
///
/// A producer selects on [`WorkerControl::stopped`] next to its own work and
/// returns once it resolves.
pub struct WorkerControl {
    group: String,
    stop_rx: mpsc::Receiver<StopSignal>,
    exit_tx: Option<oneshot::Sender<StopSignal>>,
}

impl WorkerControl {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Wait for a stop request. Cancel safe.
    ///
    /// A closed channel (supervisor gone) reads as `Requested`.
    pub async fn stopped(&mut self) -> StopSignal {
        self.stop_rx.recv().await.unwrap_or(StopSignal::Requested)
    }

    /// Non-blocking variant of [`WorkerControl::stopped`].
    pub fn try_stopped(&mut self) -> Option<StopSignal> {
        match self.stop_rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(StopSignal::Requested),
        }
    }

    /// Report exit to the supervisor. Never blocks; returns false if nobody
    /// is listening anymore. Exit is detected from task completion either way.
    pub fn ack(mut self) -> bool {
        self.exit_tx
            .take()
            .is_some_and(|tx| tx.send(StopSignal::Ack).is_ok())
    }
}

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
    /// Set once the handle leaves the map; the stop channel is then closed
    /// rather than signalled.
    detached: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

enum Reaped {
    Removed,
    AlreadyReleased,
    Superseded,
}

/// Keeps at most one producer per group and tears it down on ttl, idle,
/// or explicit stop.
pub struct Coordinator {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_generation: AtomicU64,
    config: WorkerConfig,
}

impl Coordinator {
    /// A zero idle interval is raised to 1ms.
    pub fn new(mut config: WorkerConfig) -> Self {
        config.idle_interval = config.idle_interval.max(MIN_IDLE_INTERVAL);
        Self {
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            config,
        }
    }

    /// Start a producer for `group` unless one is already running.
    ///
    /// Returns true if a new worker was started. Never waits on the producer.
    pub(crate) async fn notify<F, Fut>(
        &self,
        hub: &Arc<Hub>,
        group: &str,
        producer: F,
        ttl: Duration,
    ) -> bool
    where
        F: FnOnce(String, WorkerControl, Arc<Hub>) -> Fut + Send,
        Fut: Future<Output = Result<(), HubError>> + Send + 'static,
    {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(group) {
            debug!(group, "worker already running");
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let detached = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();

        let control = WorkerControl {
            group: group.to_string(),
            stop_rx,
            exit_tx: Some(exit_tx),
        };
        let task = tokio::spawn(producer(group.to_string(), control, Arc::clone(hub)));

        let supervisor = Supervisor {
            hub: Arc::clone(hub),
            group: group.to_string(),
            generation,
            ttl,
            config: self.config.clone(),
            cancel: cancel.clone(),
            detached: detached.clone(),
        };
        tokio::spawn(supervisor.run(task, stop_tx, exit_rx));

        workers.insert(
            group.to_string(),
            WorkerHandle {
                generation,
                cancel,
                detached,
            },
        );
        info!(group, generation, ttl_secs = ttl.as_secs(), "worker started");
        true
    }

    /// Remove the group's worker and have its supervisor stop the producer.
    ///
    /// Idempotent: returns false when there was nothing to release.
    pub async fn release(&self, group: &str) -> bool {
        let Some(handle) = self.workers.lock().await.remove(group) else {
            return false;
        };
        handle.detach();
        info!(group, generation = handle.generation, "worker released");
        true
    }

    /// Ask the group's producer to stop; the handle stays until it exits.
    pub async fn stop(&self, group: &str) -> bool {
        match self.workers.lock().await.get(group) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Groups with an active worker, sorted.
    pub async fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Release every worker. Returns how many were released.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(String, WorkerHandle)> = self.workers.lock().await.drain().collect();
        for (group, handle) in &drained {
            debug!(group = %group, generation = handle.generation, "releasing worker for shutdown");
            handle.detach();
        }
        drained.len()
    }

    async fn reap(&self, group: &str, generation: u64) -> Reaped {
        let mut workers = self.workers.lock().await;
        match workers.get(group) {
            Some(handle) if handle.generation == generation => {
                workers.remove(group);
                Reaped::Removed
            }
            Some(_) => Reaped::Superseded,
            None => Reaped::AlreadyReleased,
        }
    }
}

/// Watches one producer. The only task that sends stop requests to it.
struct Supervisor {
    hub: Arc<Hub>,
    group: String,
    generation: u64,
    ttl: Duration,
    config: WorkerConfig,
    cancel: CancellationToken,
    detached: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(
        self,
        mut task: JoinHandle<Result<(), HubError>>,
        stop_tx: mpsc::Sender<StopSignal>,
        mut exit_rx: oneshot::Receiver<StopSignal>,
    ) {
        let mut stop_tx = Some(stop_tx);
        let deadline = tokio::time::sleep(self.ttl);
        tokio::pin!(deadline);
        let grace = tokio::time::sleep(self.config.grace);
        tokio::pin!(grace);

        let mut idle = tokio::time::interval_at(
            Instant::now() + self.config.idle_interval,
            self.config.idle_interval,
        );
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stop_sent: Option<StopSignal> = None;
        let mut exit_reported = false;
        let mut grace_armed = false;
        let mut aborted = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut task => break outcome,
                report = &mut exit_rx, if !exit_reported => {
                    exit_reported = true;
                    if report.is_ok() {
                        debug!(group = %self.group, generation = self.generation, "producer acknowledged exit");
                    }
                }
                () = &mut deadline, if stop_sent.is_none() => {
                    stop_sent = Some(self.request_stop(&mut stop_tx, StopSignal::Timeout));
                }
                _ = idle.tick(), if stop_sent.is_none() => {
                    if self.hub.group_len(&self.group).await == 0 {
                        stop_sent = Some(self.request_stop(&mut stop_tx, StopSignal::Idle));
                    }
                }
                () = self.cancel.cancelled(), if stop_sent.is_none() => {
                    stop_sent = Some(self.request_stop(&mut stop_tx, StopSignal::Requested));
                }
                () = &mut grace, if grace_armed => {
                    warn!(
                        group = %self.group,
                        generation = self.generation,
                        grace_ms = self.config.grace.as_millis() as u64,
                        "producer did not exit within grace window, aborting"
                    );
                    task.abort();
                    grace_armed = false;
                    aborted = true;
                }
            }

            if (stop_sent.is_some() || exit_reported) && !grace_armed && !aborted {
                grace.as_mut().reset(Instant::now() + self.config.grace);
                grace_armed = true;
            }
        };

        match &outcome {
            Ok(Ok(())) => info!(
                group = %self.group,
                generation = self.generation,
                signal = ?stop_sent,
                "producer exited"
            ),
            Ok(Err(e)) => warn!(
                group = %self.group,
                generation = self.generation,
                "producer exited with error: {}",
                e
            ),
            Err(e) if e.is_cancelled() => warn!(
                group = %self.group,
                generation = self.generation,
                "producer aborted"
            ),
            Err(e) => error!(
                group = %self.group,
                generation = self.generation,
                "producer panicked: {}",
                e
            ),
        }

        match self.hub.coordinator().reap(&self.group, self.generation).await {
            Reaped::Superseded => {
                debug!(group = %self.group, "newer worker owns the group, leaving sessions open");
            }
            Reaped::Removed | Reaped::AlreadyReleased => {
                // Membership is not restored: clients reconnect and rejoin.
                let closed = self.hub.close_group_with_msg(&self.group, &[]).await;
                if closed > 0 {
                    info!(group = %self.group, closed, "closed group sessions after worker exit");
                }
            }
        }
    }

    fn request_stop(
        &self,
        stop_tx: &mut Option<mpsc::Sender<StopSignal>>,
        signal: StopSignal,
    ) -> StopSignal {
        if self.detached.load(Ordering::Acquire) {
            // Released: closing the channel reads as `Requested` on the other end.
            stop_tx.take();
            info!(
                group = %self.group,
                generation = self.generation,
                "worker released, control channel closed"
            );
            return StopSignal::Requested;
        }

        // Capacity 1 and sent at most once per worker.
        if let Some(tx) = stop_tx.as_ref() {
            if tx.try_send(signal).is_err() {
                debug!(group = %self.group, "producer no longer listening for stop");
            }
        }
        info!(
            group = %self.group,
            generation = self.generation,
            %signal,
            "stop requested"
        );
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn hub(idle_ms: u64, grace_ms: u64) -> Arc<Hub> {
        Hub::with_session_mux(WorkerConfig {
            idle_interval: Duration::from_millis(idle_ms),
            grace: Duration::from_millis(grace_ms),
        })
    }

    /// Runs until told to stop, then acks.
    async fn idle_producer(
        _group: String,
        mut control: WorkerControl,
        _hub: Arc<Hub>,
    ) -> Result<(), HubError> {
        control.stopped().await;
        control.ack();
        Ok(())
    }

    #[test]
    fn test_stop_signal_codes() {
        assert_eq!(StopSignal::Ack.code(), 0);
        assert_eq!(StopSignal::Timeout.code(), 1);
        assert_eq!(StopSignal::Idle.code(), 2);
        assert_eq!(StopSignal::Timeout.to_string(), "timeout(1)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_twice_starts_one_producer() {
        let hub = hub(1000, 3000);
        let starts = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let starts = starts.clone();
            hub.notify(
                "g",
                move |group, control, hub| {
                    starts.fetch_add(1, Ordering::SeqCst);
                    idle_producer(group, control, hub)
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(hub.workers().await, vec!["g".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_group_reaped_and_restartable() {
        let hub = hub(1000, 3000);
        assert!(
            hub.notify("g", idle_producer, Duration::from_secs(3600))
                .await
                .unwrap()
        );

        // No members: first idle check at 1s stops it.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(hub.workers().await.is_empty());

        assert!(
            hub.notify("g", idle_producer, Duration::from_secs(3600))
                .await
                .unwrap()
        );
        assert_eq!(hub.workers().await, vec!["g".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_idle_interval_still_reaps() {
        let hub = Hub::with_session_mux(WorkerConfig {
            idle_interval: Duration::ZERO,
            grace: Duration::from_secs(1),
        });
        assert!(
            hub.notify("g", idle_producer, Duration::from_secs(2))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(hub.workers().await.is_empty());
        assert!(
            hub.notify("g", idle_producer, Duration::from_secs(2))
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_worker_is_idempotent() {
        let hub = hub(1000, 3000);
        hub.notify("g", idle_producer, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(hub.release_worker("g").await);
        assert!(!hub.release_worker("g").await);
        assert!(hub.workers().await.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!hub.release_worker("g").await);
    }

    /// Reports what the producer saw: the signal, and whether the channel
    /// was closed behind it.
    fn observing_producer(
        report: oneshot::Sender<(StopSignal, bool)>,
    ) -> impl FnOnce(String, WorkerControl, Arc<Hub>) -> std::pin::Pin<
        Box<dyn Future<Output = Result<(), HubError>> + Send>,
    > + Send {
        move |_group: String, mut control: WorkerControl, _hub: Arc<Hub>| {
            Box::pin(async move {
                let signal = control.stopped().await;
                let closed = control.try_stopped().is_some();
                let _ = report.send((signal, closed));
                control.ack();
                Ok(())
            }) as std::pin::Pin<Box<dyn Future<Output = Result<(), HubError>> + Send>>
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_worker_channel_is_closed_not_signalled() {
        let hub = hub(1000, 3000);
        let (tx, rx) = oneshot::channel();
        hub.notify("g", observing_producer(tx), Duration::from_secs(3600))
            .await
            .unwrap();

        hub.release_worker("g").await;
        assert_eq!(rx.await.unwrap(), (StopSignal::Requested, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_worker_receives_signal() {
        let hub = hub(1000, 3000);
        let (tx, rx) = oneshot::channel();
        hub.notify("g", observing_producer(tx), Duration::from_secs(3600))
            .await
            .unwrap();

        hub.stop_worker("g").await;
        assert_eq!(rx.await.unwrap(), (StopSignal::Requested, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_supervisor_leaves_new_worker_alone() {
        let hub = hub(1000, 3000);
        let (session, mut rx) =
            crate::Session::new(crate::Attachment::new("g", "g_1").unwrap());
        hub.handle_connect(session.clone()).await;

        hub.notify("g", idle_producer, Duration::from_secs(3600))
            .await
            .unwrap();
        hub.release_worker("g").await;
        assert!(
            hub.notify("g", idle_producer, Duration::from_secs(3600))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.workers().await, vec!["g".to_string()]);
        assert!(!session.is_closed());
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_worker_reaps_after_exit() {
        let hub = hub(1000, 3000);
        hub.notify("g", idle_producer, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(hub.stop_worker("g").await);
        assert!(!hub.stop_worker("other").await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hub.workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_producer_aborted_after_grace() {
        let hub = hub(1000, 3000);
        let (session, _rx) = crate::Session::new(crate::Attachment::new("g", "g_1").unwrap());
        hub.handle_connect(session).await;

        hub.notify(
            "g",
            |_group, _control, _hub| async {
                tokio::time::sleep(Duration::from_secs(86400)).await;
                Ok(())
            },
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(hub.workers().await, vec!["g".to_string()]);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(hub.workers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_producer_is_reaped() {
        let hub = hub(1000, 3000);
        let (session, mut rx) =
            crate::Session::new(crate::Attachment::new("g", "g_1").unwrap());
        hub.handle_connect(session.clone()).await;

        hub.notify(
            "g",
            |_group, _control, _hub| async { Err(HubError::Producer("upstream gone".into())) },
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hub.workers().await.is_empty());
        assert!(session.is_closed());
        assert_eq!(rx.recv().await, Some(crate::Outbound::Close(Vec::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_stopped_sees_closed_channel() {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let mut control = WorkerControl {
            group: "g".to_string(),
            stop_rx,
            exit_tx: None,
        };
        assert_eq!(control.try_stopped(), None);
        stop_tx.send(StopSignal::Idle).await.unwrap();
        assert_eq!(control.try_stopped(), Some(StopSignal::Idle));
        drop(stop_tx);
        assert_eq!(control.try_stopped(), Some(StopSignal::Requested));
        assert!(!control.ack());
    }
}
