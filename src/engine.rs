//! Steady-state load engine.
//!
//! Holds exactly K requests in flight for a fixed wall-clock window. K owned
//! semaphore permits gate submission: the loop acquires a permit, spawns one
//! task that runs the action and releases the permit when it resolves. The
//! permit count is fixed for the call; varying K across calls is the
//! prober's job, not the engine's.
//!
//! The engine is generic over the action that issues one request, so any
//! client (or a synthetic stand-in under test) can sit behind it.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};

use crate::client::Outcome;

/// Raw product of holding one concurrency level.
#[derive(Debug)]
pub struct LevelRun {
    pub outcomes: Vec<Outcome>,
    /// Actual wall clock spent, including the drain of in-flight requests.
    pub elapsed: Duration,
}

/// Resolves once `rx` observes `true`. A dropped sender can never cancel
/// anything, so that case parks forever instead of resolving.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct SteadyStateEngine<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    action: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> SteadyStateEngine<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    pub fn new(action: F) -> Self {
        Self {
            action,
            _marker: PhantomData,
        }
    }

    /// Drive the action at exactly `concurrency` in flight until `duration`
    /// elapses or `cancel` flips, then wait out the stragglers.
    ///
    /// Failures inside spawned requests are captured as outcomes and never
    /// propagate; the engine itself cannot fail.
    pub async fn run_level(
        &self,
        concurrency: usize,
        duration: Duration,
        cancel: watch::Receiver<bool>,
    ) -> LevelRun {
        let permits = Arc::new(Semaphore::new(concurrency));
        let sink: Arc<Mutex<Vec<Outcome>>> = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();
        let deadline = started + duration;
        let sleep_deadline = tokio::time::Instant::from_std(deadline);
        let submit_cancelled = cancelled(cancel.clone());
        tokio::pin!(submit_cancelled);

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.expect("load semaphore closed")
                }
                _ = &mut submit_cancelled => break,
                _ = tokio::time::sleep_until(sleep_deadline) => break,
            };
            if Instant::now() >= deadline {
                break;
            }
            let action = self.action.clone();
            let sink = Arc::clone(&sink);
            let task_cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    outcome = action() => outcome,
                    _ = cancelled(task_cancel) => Outcome::Cancelled,
                };
                sink.lock().expect("outcome sink lock").push(outcome);
                drop(permit);
            });
        }

        // All K permits back means nothing is still in flight.
        let _drained = permits
            .acquire_many(concurrency as u32)
            .await
            .expect("load semaphore closed");
        let elapsed = started.elapsed();
        let outcomes = std::mem::take(&mut *sink.lock().expect("outcome sink lock"));
        LevelRun { outcomes, elapsed }
    }
}
