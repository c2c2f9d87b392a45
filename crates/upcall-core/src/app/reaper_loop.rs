//! ReaperLoop - periodic timeout sweep.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::engine::Engine;

/// ReaperLoop は期限切れの operation を TimedOut にする
///
/// # フロー
/// 1. `sweep_interval` ごとに tick
/// 2. pending queue と全 bucket を sweep
/// 3. engine shutdown か `stop()` で終了
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn<Req, Resp>(engine: Arc<Engine<Req, Resp>>) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = engine.config().sweep_interval();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if engine.is_shutting_down() {
                            break;
                        }
                        let expired = engine.sweep_expired();
                        if expired > 0 {
                            debug!(expired, "timeout sweep");
                        }
                    }
                }
            }
        });

        Self { shutdown_tx, join }
    }

    pub async fn stop(self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
