use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use crate::channel::network_channel::NetworkChannel;
use crate::codec::ChannelMessage;


/// Something driven by a periodic tick, getting the time elapsed since the previous tick
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    async fn tick(&self, elapsed: Duration);
}

#[async_trait]
impl<M: ChannelMessage> Tick for NetworkChannel<M> {
    async fn tick(&self, elapsed: Duration) {
        NetworkChannel::tick(self, elapsed).await
    }
}

#[async_trait]
impl<T: Tick> Tick for Arc<T> {
    async fn tick(&self, elapsed: Duration) {
        self.as_ref().tick(elapsed).await
    }
}


/// Ticks `target` every `period`, passing the time that actually elapsed since the previous
///  tick. This never returns, it is meant to be spawned and aborted.
pub async fn run_ticker<T: Tick>(target: T, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_tick = Instant::now();
    loop {
        interval.tick().await;
        let now = Instant::now();
        trace!("tick");
        target.tick(now - last_tick).await;
        last_tick = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_run_ticker() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut target = MockTick::new();
        target.expect_tick()
            .returning(move |elapsed| {
                sender.send(elapsed).unwrap();
            });

        let ticker = tokio::spawn(run_ticker(target, Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(350)).await;
        ticker.abort();

        let mut ticks = Vec::new();
        while let Ok(elapsed) = receiver.try_recv() {
            ticks.push(elapsed);
        }
        assert_eq!(ticks, vec![
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ]);
    }
}
