//! Response waiter
//!
//! Waits for the first message on a call's reply subject, bounded by a tick
//! budget. The message and the tick clock race in a single `select!`, so a
//! call resolves exactly once: either with the first delivery or when the
//! budget runs out.

use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::transport::Subscription;

/// Tick length used by the backend
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Ticks a command RPC waits before timing out
pub const RPC_TICKS: u32 = 5;

/// Ticks a session pull waits before timing out
pub const PULL_TICKS: u32 = 30;

/// Maximum wait, expressed as a number of fixed-length ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub ticks: u32,
    pub tick: Duration,
}

impl WaitBudget {
    pub fn new(ticks: u32, tick: Duration) -> Self {
        Self { ticks, tick }
    }

    /// Budget for command RPC calls
    pub fn rpc(tick: Duration) -> Self {
        Self::new(RPC_TICKS, tick)
    }

    /// Budget for the slower session-pull calls
    pub fn pull(tick: Duration) -> Self {
        Self::new(PULL_TICKS, tick)
    }

    /// Total wall-clock budget
    pub fn total(&self) -> Duration {
        self.tick * self.ticks
    }
}

impl Default for WaitBudget {
    fn default() -> Self {
        Self::rpc(DEFAULT_TICK)
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// First message on the reply subject
    Message(Bytes),
    /// Budget exhausted with no message
    TimedOut,
}

/// Wait for one reply on `subscription`
///
/// Delivery errors are logged and the wait goes on. If the subscription
/// ends early the wait still runs to the end of its budget.
pub async fn wait_for_reply(
    subscription: &mut dyn Subscription,
    budget: WaitBudget,
    reply_to: &str,
) -> WaitOutcome {
    let start = Instant::now();
    // interval_at panics on a zero period
    let tick = budget.tick.max(Duration::from_millis(1));
    let mut ticker = interval_at(start + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut elapsed_ticks = 0u32;
    let mut open = true;

    while elapsed_ticks < budget.ticks {
        tokio::select! {
            // A message that lands on the same instant as the last tick wins
            biased;

            delivery = subscription.next(), if open => match delivery {
                Some(Ok(payload)) => {
                    debug!(
                        "Reply on {} after {}ms",
                        reply_to,
                        start.elapsed().as_millis()
                    );
                    return WaitOutcome::Message(payload);
                }
                Some(Err(e)) => {
                    warn!("Delivery error on {}: {}", reply_to, e);
                }
                None => {
                    warn!("Subscription on {} ended before a reply", reply_to);
                    open = false;
                }
            },

            _ = ticker.tick() => {
                elapsed_ticks += 1;
                debug!("Waiting on {} ({}/{})", reply_to, elapsed_ticks, budget.ticks);
            }
        }
    }

    debug!("No reply on {} after {} ticks", reply_to, budget.ticks);
    WaitOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::memory::MemoryBroker;

    const SUBJECT: &str = "autopilot.response.test";

    #[test]
    fn test_budget_totals() {
        assert_eq!(WaitBudget::rpc(DEFAULT_TICK).total(), Duration::from_secs(5));
        assert_eq!(WaitBudget::pull(DEFAULT_TICK).total(), Duration::from_secs(30));
        assert_eq!(WaitBudget::default(), WaitBudget::new(5, Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_message_wins() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT);

        broker.publish(SUBJECT, Bytes::from_static(b"first"));
        broker.publish(SUBJECT, Bytes::from_static(b"second"));

        let outcome = wait_for_reply(&mut sub, WaitBudget::default(), SUBJECT).await;
        assert_eq!(outcome, WaitOutcome::Message(Bytes::from_static(b"first")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_budget() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT);

        let start = Instant::now();
        let outcome = wait_for_reply(&mut sub, WaitBudget::default(), SUBJECT).await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(6), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_error_does_not_resolve() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT);

        broker.inject_error(SUBJECT, "slow consumer");
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            publisher.publish(SUBJECT, Bytes::from_static(b"late"));
        });

        let outcome = wait_for_reply(&mut sub, WaitBudget::default(), SUBJECT).await;
        assert_eq!(outcome, WaitOutcome::Message(Bytes::from_static(b"late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_subscription_still_waits_out_budget() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT);
        sub.unsubscribe().await.unwrap();

        let start = Instant::now();
        let outcome = wait_for_reply(&mut sub, WaitBudget::new(3, DEFAULT_TICK), SUBJECT).await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_budget_is_thirty_ticks() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(SUBJECT);

        let start = Instant::now();
        let outcome = wait_for_reply(&mut sub, WaitBudget::pull(DEFAULT_TICK), SUBJECT).await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(29), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(31), "elapsed {:?}", elapsed);
    }
}
