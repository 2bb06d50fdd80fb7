use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Single-threaded event loop multiplexing fd readiness and periodic timers.
/// Callbacks run on the one driving thread; a timer body blocks every other
/// timer and capture callback until it returns.
pub struct EventLoop {
    local: LocalSet,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            local: LocalSet::new(),
        }
    }

    /// Watches `io` for readability. `on_ready` is invoked once per readiness
    /// event and must drain the descriptor until it would block.
    pub fn add_fd<T, F>(&self, io: T, mut on_ready: F) -> anyhow::Result<()>
    where
        T: AsRawFd + 'static,
        F: FnMut(&T) + 'static,
    {
        let fd = AsyncFd::with_interest(io, Interest::READABLE)?;
        self.local.spawn_local(async move {
            loop {
                let mut guard = match fd.readable().await {
                    Ok(guard) => guard,
                    Err(err) => {
                        tracing::error!("watched descriptor failed: {}", err);
                        break;
                    }
                };
                on_ready(fd.get_ref());
                guard.clear_ready();
            }
        });
        Ok(())
    }

    /// Fires `callback` every `period`. Deadlines advance from the previous
    /// deadline, not from the callback's completion, so a slow callback does
    /// not shift the schedule by more than one period.
    pub fn add_timer<F>(&self, period: Duration, mut callback: F)
    where
        F: FnMut() + 'static,
    {
        self.local.spawn_local(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                timer.tick().await;
                callback();
            }
        });
    }

    /// Drives all registered sources and timers until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.local
            .run_until(async move {
                tokio::select! {
                    _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            })
            .await;

        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
