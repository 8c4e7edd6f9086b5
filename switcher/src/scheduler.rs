use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run `job` now and then every `interval` until the handle is aborted.
///
/// Each run is awaited before the next tick is taken, so runs of one job
/// never overlap; ticks missed while a run is slow are skipped.
pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(task = name, interval_secs = interval.as_secs(), "periodic task started");

        loop {
            // first tick completes immediately
            ticker.tick().await;
            job().await;
        }
    })
}
