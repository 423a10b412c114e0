//! Ping/pong liveness tracking.
//!
//! [`HeartbeatMonitor`] knows nothing about sockets. While it is beating it invokes a ping
//! action on a fixed cadence and remembers when liveness was last confirmed. Timeouts can be
//! observed two ways:
//!
//! - by polling [`HeartbeatMonitor::has_timed_out`], a pure read, or
//! - by registering [`HeartbeatMonitor::on_timeout`], which the timer invokes instead of the
//!   ping action on every tick that finds the monitor timed out. Each run of the timer keeps
//!   the handler that was registered when it was started.
//!
//! The cadence is the configured [`HeartbeatConfig::interval`] and cannot change while the
//! monitor exists.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::HeartbeatConfig;
use crate::error::AlreadyBeating;

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

type TimeoutHandler = Arc<dyn Fn() + Send + Sync>;

/// Cancels the timer task when dropped, so the task never outlives its monitor.
#[derive(Debug)]
struct Timer(CancellationToken);

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[derive(Debug, Default)]
struct Beat {
    /// Only meaningful while `timer` is set
    last_beat: Option<Instant>,
    timer: Option<Timer>,
}

struct Inner {
    config: HeartbeatConfig,
    beat: Mutex<Beat>,
    on_timeout: Mutex<Option<TimeoutHandler>>,
}

impl Inner {
    // Beat only holds plain values, a poisoned lock is still consistent.
    fn beat(&self) -> MutexGuard<'_, Beat> {
        self.beat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_timed_out(&self) -> bool {
        self.beat()
            .last_beat
            .is_some_and(|last| last.elapsed() > self.config.timeout())
    }

    fn timeout_handler(&self) -> Option<TimeoutHandler> {
        self.on_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Tracks ping/pong timing and fires a ping action on a fixed cadence.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// use resilient_tcp::config::HeartbeatConfig;
/// use resilient_tcp::heartbeat::HeartbeatMonitor;
///
/// #[tokio::main]
/// async fn main() -> resilient_tcp::Result<()> {
///     let config = HeartbeatConfig::builder()
///         .interval(Duration::from_millis(500))
///         .timeout(Duration::from_secs(2))
///         .build();
///     let heartbeat = HeartbeatMonitor::new(config);
///
///     heartbeat.on_timeout(|| println!("peer went quiet"));
///     heartbeat.start(|| println!("ping"))?;
///
///     // ... call `heartbeat.received_pong()` whenever the peer answers
///     heartbeat.stop();
///     Ok(())
/// }
/// ```
pub struct HeartbeatMonitor {
    inner: Arc<Inner>,
}

impl fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("config", &self.inner.config)
            .field("beating", &self.is_beating())
            .finish()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(HeartbeatConfig::default())
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                beat: Mutex::new(Beat::default()),
                on_timeout: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HeartbeatConfig {
        &self.inner.config
    }

    /// The cadence pings are fired at.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.config.interval()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout()
    }

    #[must_use]
    pub fn ping(&self) -> &[u8] {
        self.inner.config.ping()
    }

    #[must_use]
    pub fn pong(&self) -> &[u8] {
        self.inner.config.pong()
    }

    /// Register the handler the timer invokes when it finds the monitor timed out. Replaces any
    /// previous handler, taking effect from the next [`Self::start`].
    ///
    /// The handler is called from the timer task in place of the ping action. It is typically
    /// used to tear the connection down, which stops the monitor.
    pub fn on_timeout<F: Fn() + Send + Sync + 'static>(&self, handler: F) {
        *self
            .inner
            .on_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Remove the timeout handler. From the next [`Self::start`], timeouts are only observable
    /// through [`Self::has_timed_out`].
    pub fn clear_on_timeout(&self) {
        *self
            .inner
            .on_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Start beating: liveness is confirmed as of now and `ping` is invoked once per interval,
    /// first after one full interval has elapsed.
    ///
    /// # Errors
    ///
    /// Fails with [`AlreadyBeating`] if the monitor is running. Call [`Self::stop`] first.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F: Fn() + Send + Sync + 'static>(&self, ping: F) -> Result<()> {
        let mut beat = self.inner.beat();
        if beat.timer.is_some() {
            return Err(AlreadyBeating.into());
        }

        let token = CancellationToken::new();
        beat.last_beat = Some(Instant::now());
        beat.timer = Some(Timer(token.clone()));
        drop(beat);

        let inner = Arc::clone(&self.inner);
        let on_timeout = self.inner.timeout_handler();
        tokio::spawn(async move {
            Self::timer_loop(inner, token, ping, on_timeout).await;
        });

        Ok(())
    }

    async fn timer_loop<F: Fn()>(
        inner: Arc<Inner>,
        token: CancellationToken,
        ping: F,
        on_timeout: Option<TimeoutHandler>,
    ) {
        let period = inner.config.interval().max(MIN_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = token.cancelled() => break,

                _ = ticker.tick() => {
                    if inner.has_timed_out()
                        && let Some(handler) = &on_timeout
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: no pong received within {:?}",
                            inner.config.timeout()
                        );
                        handler();
                        continue;
                    }

                    ping();
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Heartbeat timer stopped");
    }

    /// Stop beating. Safe to call when already stopped.
    pub fn stop(&self) {
        let timer = {
            let mut beat = self.inner.beat();
            beat.last_beat = None;
            beat.timer.take()
        };
        drop(timer);
    }

    /// `true` iff the timer is running.
    #[must_use]
    pub fn is_beating(&self) -> bool {
        self.inner.beat().timer.is_some()
    }

    /// `true` iff more than the configured timeout has elapsed since the last pong, or since
    /// [`Self::start`] if none arrived. Always `false` while stopped.
    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.inner.has_timed_out()
    }

    /// Confirm liveness as of now. Ignored while stopped.
    pub fn received_pong(&self) {
        if let Some(last) = self.inner.beat().last_beat.as_mut() {
            *last = Instant::now();
        }
    }

    /// When liveness was last confirmed, `None` while stopped.
    #[must_use]
    pub fn last_beat(&self) -> Option<Instant> {
        self.inner.beat().last_beat
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use super::*;
    use crate::error::Kind;

    fn monitor(interval_ms: u64, timeout_ms: u64) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            HeartbeatConfig::builder()
                .interval(Duration::from_millis(interval_ms))
                .timeout(Duration::from_millis(timeout_ms))
                .build(),
        )
    }

    fn counting() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        (calls, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn exposes_configured_values() {
        let heartbeat = HeartbeatMonitor::new(
            HeartbeatConfig::builder()
                .interval(Duration::from_millis(500))
                .timeout(Duration::from_secs(3))
                .ping(vec![0x03])
                .pong(vec![0x04])
                .build(),
        );

        assert_eq!(heartbeat.interval(), Duration::from_millis(500));
        assert_eq!(heartbeat.timeout(), Duration::from_secs(3));
        assert_eq!(heartbeat.ping(), &[0x03]);
        assert_eq!(heartbeat.pong(), &[0x04]);
    }

    #[test]
    fn not_beating_before_start() {
        let heartbeat = HeartbeatMonitor::default();

        assert!(!heartbeat.is_beating(), "fresh monitor must be idle");
        assert!(!heartbeat.has_timed_out(), "idle monitor never times out");
        assert!(heartbeat.last_beat().is_none(), "no beat recorded yet");
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_every_interval_after_start() {
        let heartbeat = monitor(500, 5_000);
        let (calls, ping) = counting();

        heartbeat.start(ping).unwrap();
        sleep(Duration::from_millis(1_050)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_pinging_after_stop() {
        let heartbeat = monitor(500, 5_000);
        let (calls, ping) = counting();

        heartbeat.start(ping).unwrap();
        sleep(Duration::from_millis(600)).await;
        heartbeat.stop();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn beating_follows_start_and_stop() {
        let heartbeat = monitor(500, 5_000);

        heartbeat.start(|| {}).unwrap();
        assert!(heartbeat.is_beating(), "started monitor must beat");
        assert!(heartbeat.last_beat().is_some(), "start records a beat");

        heartbeat.stop();
        assert!(!heartbeat.is_beating(), "stopped monitor must not beat");
        assert!(heartbeat.last_beat().is_none(), "stop clears the last beat");

        heartbeat.stop();
        assert!(!heartbeat.is_beating(), "second stop is a no-op");
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let heartbeat = monitor(500, 5_000);

        heartbeat.start(|| {}).unwrap();
        let err = heartbeat.start(|| {}).unwrap_err();

        assert_eq!(err.kind(), Kind::Validation);
        assert!(err.downcast_ref::<AlreadyBeating>().is_some(), "got {err}");
        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_pong() {
        let heartbeat = monitor(1_000, 50);

        heartbeat.start(|| {}).unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(heartbeat.has_timed_out(), "no pong within 50ms");
        heartbeat.stop();
        assert!(!heartbeat.has_timed_out(), "stopped monitor never times out");
    }

    #[tokio::test(start_paused = true)]
    async fn pong_resets_the_clock() {
        let heartbeat = monitor(1_000, 100);

        heartbeat.start(|| {}).unwrap();
        sleep(Duration::from_millis(50)).await;
        heartbeat.received_pong();
        assert!(!heartbeat.has_timed_out(), "pong just arrived");

        sleep(Duration::from_millis(60)).await;
        assert!(
            !heartbeat.has_timed_out(),
            "110ms since start but only 60ms since the pong"
        );
        heartbeat.stop();
    }

    #[tokio::test]
    async fn pong_while_stopped_is_ignored() {
        let heartbeat = monitor(1_000, 100);

        heartbeat.received_pong();

        assert!(heartbeat.last_beat().is_none(), "pong must not start the clock");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_handler_replaces_ping() {
        let heartbeat = Arc::new(monitor(10, 25));
        let (pings, ping) = counting();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let stopper = Arc::downgrade(&heartbeat);
        heartbeat.on_timeout(move || {
            drop(tx.send(()));
            if let Some(heartbeat) = stopper.upgrade() {
                heartbeat.stop();
            }
        });
        heartbeat.start(ping).unwrap();

        rx.recv().await.unwrap();

        // Ticks at 10ms and 20ms ping, the 30ms tick finds 30ms > 25ms of silence
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert!(!heartbeat.is_beating(), "handler stopped the monitor");

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no further timeouts once stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_pinging_when_polled_instead() {
        let heartbeat = monitor(10, 25);
        let (pings, ping) = counting();

        heartbeat.start(ping).unwrap();
        sleep(Duration::from_millis(55)).await;

        assert!(heartbeat.has_timed_out(), "no pongs were received");
        assert_eq!(pings.load(Ordering::SeqCst), 5);
        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn running_timer_keeps_its_own_handler() {
        let heartbeat = monitor(10, 25);
        let (first_calls, first) = counting();
        let (second_calls, second) = counting();

        heartbeat.on_timeout(first);
        heartbeat.start(|| {}).unwrap();
        heartbeat.on_timeout(second);
        sleep(Duration::from_millis(35)).await;

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            second_calls.load(Ordering::SeqCst),
            0,
            "a handler registered after start belongs to the next run"
        );
        heartbeat.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_handler_lets_pings_continue_past_the_timeout() {
        let heartbeat = monitor(10, 25);
        let (timeouts, on_timeout) = counting();
        let (pings, ping) = counting();

        heartbeat.on_timeout(on_timeout);
        heartbeat.clear_on_timeout();
        heartbeat.start(ping).unwrap();
        sleep(Duration::from_millis(55)).await;

        assert!(heartbeat.has_timed_out(), "no pongs were received");
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(pings.load(Ordering::SeqCst), 5);
        heartbeat.stop();
    }
}
