use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs an action on a fixed interval in the background.
///
/// The action fires immediately on start and then once per interval. Each tick
/// is spawned as its own task, so a slow action does not delay the next tick and
/// ticks may overlap. Stopping only prevents future ticks; actions already
/// running are left to finish.
pub struct Poller {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn start<F, Fut>(name: &'static str, every: Duration, action: F) -> Poller
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("Starting {name} poller every {every:?}");
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tokio::spawn(action());
            }
        });

        Poller {
            name,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Stopping {} poller", self.name);
            handle.abort();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}
