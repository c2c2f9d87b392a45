//! Service-agent side: a pool of tasks that claim operations from an engine,
//! perform them, and report back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::Tag;
use crate::engine::Engine;

/// What a handler decided to do with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition<Resp> {
    /// Answer with a response.
    Reply(Resp),

    /// Answer with a failure reason.
    Fail(String),

    /// Never answer (the caller will eventually time out).
    NoReply,
}

/// Performs requests on behalf of the service agent.
#[async_trait]
pub trait ServiceHandler<Req, Resp>: Send + Sync {
    async fn service(&self, tag: Tag, request: &Req) -> Disposition<Resp>;
}

/// Agent group handle.
/// - `shutdown_and_join()` で新規 claim を止め、全エージェントの終了を待つ
/// - engine が shutdown するとエージェントは自ら終了する
pub struct AgentGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl AgentGroup {
    /// Spawn `n` agents sharing `handler`.
    pub fn spawn<Req, Resp>(
        n: usize,
        engine: Arc<Engine<Req, Resp>>,
        handler: Arc<dyn ServiceHandler<Req, Resp>>,
    ) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|agent_id| {
                let engine = Arc::clone(&engine);
                let handler = Arc::clone(&handler);
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    agent_loop(agent_id, engine, handler, &mut rx).await;
                })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: every agent may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

async fn agent_loop<Req, Resp>(
    agent_id: usize,
    engine: Arc<Engine<Req, Resp>>,
    handler: Arc<dyn ServiceHandler<Req, Resp>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let claimed = tokio::select! {
            changed = shutdown_rx.changed() => {
                // a dropped group handle counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            claimed = engine.claim_next() => claimed,
        };

        // Engine closed: the channel to call sites is gone.
        let Some(claimed) = claimed else {
            break;
        };

        let accepted = match handler.service(claimed.tag, &claimed.request).await {
            Disposition::Reply(response) => engine.complete(claimed.tag, response),
            Disposition::Fail(reason) => engine.fail(claimed.tag, reason),
            Disposition::NoReply => {
                trace!(agent_id, tag = %claimed.tag, "dropping request");
                continue;
            }
        };
        if !accepted {
            debug!(agent_id, tag = %claimed.tag, "response arrived after the caller gave up");
        }
    }
    debug!(agent_id, "agent stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Timeout;
    use crate::error::DispatchError;

    struct Doubler;

    #[async_trait]
    impl ServiceHandler<u32, u32> for Doubler {
        async fn service(&self, _tag: Tag, request: &u32) -> Disposition<u32> {
            match *request {
                0 => Disposition::Fail("zero".to_string()),
                13 => Disposition::NoReply,
                n => Disposition::Reply(n * 2),
            }
        }
    }

    fn engine() -> Arc<Engine<u32, u32>> {
        Arc::new(
            Engine::new(EngineConfig {
                hash_table_size: 7,
                op_timeout_secs: 0,
                ..EngineConfig::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn agents_answer_submitted_operations() {
        let engine = engine();
        let agents = AgentGroup::spawn(3, Arc::clone(&engine), Arc::new(Doubler));
        assert_eq!(agents.len(), 3);

        // 13 is never answered; it is covered by `dropped_request_times_out`.
        let requests: Vec<u32> = (1..=12).chain(14..=20).collect();
        let handles: Vec<_> = requests
            .iter()
            .map(|&n| engine.submit(n, Timeout::Never).unwrap())
            .collect();
        for (&n, handle) in requests.iter().zip(&handles) {
            assert_eq!(engine.wait(handle).await, Ok(n * 2));
        }

        let failed = engine.submit(0, Timeout::Never).unwrap();
        assert_eq!(
            engine.wait(&failed).await,
            Err(DispatchError::Service("zero".to_string()))
        );

        agents.shutdown_and_join().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_request_times_out() {
        let engine = engine();
        let agents = AgentGroup::spawn(1, Arc::clone(&engine), Arc::new(Doubler));

        let handle = engine
            .submit(13, Timeout::After(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(engine.wait(&handle).await, Err(DispatchError::TimedOut));

        agents.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn agents_exit_when_engine_shuts_down() {
        let engine = engine();
        let agents = AgentGroup::spawn(2, Arc::clone(&engine), Arc::new(Doubler));
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.shutdown();
        tokio::time::timeout(Duration::from_secs(1), async {
            for join in agents.joins {
                join.await.unwrap();
            }
        })
        .await
        .unwrap();
    }
}
