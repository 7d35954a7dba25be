//! Generic typed state machine with per-transition retry.
//!
//! All application flows (backup, delete, restore) are FSMs whose transitions
//! are idempotent. Execution is serialized per instance: `run` holds the
//! state lock for the whole call, including retries.

mod retry;

pub use retry::{Backoff, RetryPolicy, TransitionError};

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

pub type TransitionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransitionError>> + Send + 'a>>;

type TransitionFn<D> = Box<dyn for<'a> Fn(&'a mut D) -> TransitionFuture<'a> + Send + Sync>;

pub struct Transition<S, D> {
    from: S,
    to: S,
    run: TransitionFn<D>,
    retry: Option<RetryPolicy>,
}

impl<S, D> Transition<S, D> {
    pub fn new(
        from: S,
        to: S,
        run: impl for<'a> Fn(&'a mut D) -> TransitionFuture<'a> + Send + Sync + 'static,
    ) -> Self {
        Self {
            from,
            to,
            run: Box::new(run),
            retry: None,
        }
    }

    /// Override the FSM's default retry policy for this transition.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("no transition registered for action {0}")]
    UnknownAction(String),

    #[error("invalid transition: action {action} runs from state {expected}, current state is {current}")]
    InvalidTransition {
        action: String,
        expected: String,
        current: String,
    },

    #[error("retry attempts exhausted")]
    RetryAttemptsExhausted(#[source] anyhow::Error),

    #[error("unrecoverable error")]
    Unrecoverable(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,
}

struct State<S, D> {
    id: S,
    data: D,
}

pub struct Fsm<S, A, D> {
    name: &'static str,
    transitions: HashMap<A, Transition<S, D>>,
    state: Mutex<State<S, D>>,
    default_retry: RetryPolicy,
    shutdown: Shutdown,
}

impl<S, A, D> Fsm<S, A, D>
where
    S: Copy + Eq + Debug + Send,
    A: Copy + Eq + Hash + Debug + Send,
    D: Send,
{
    pub fn new(
        name: &'static str,
        initial: S,
        data: D,
        transitions: HashMap<A, Transition<S, D>>,
        default_retry: RetryPolicy,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name,
            transitions,
            state: Mutex::new(State { id: initial, data }),
            default_retry,
            shutdown,
        }
    }

    /// Run a single action. The transition is retried under its policy until
    /// it succeeds, exhausts its attempts, fails unrecoverably, or a hard
    /// stop is requested. The state advances only on success.
    pub async fn run(&self, action: A) -> Result<(), FsmError> {
        debug!(name = self.name, ?action, "Acquiring FSM lock");
        let mut state = self.state.lock().await;

        let transition = self
            .transitions
            .get(&action)
            .ok_or_else(|| FsmError::UnknownAction(format!("{action:?}")))?;

        if transition.from != state.id {
            error!(
                name = self.name,
                ?action,
                current = ?state.id,
                expected = ?transition.from,
                "Invalid transition"
            );
            return Err(FsmError::InvalidTransition {
                action: format!("{action:?}"),
                expected: format!("{:?}", transition.from),
                current: format!("{:?}", state.id),
            });
        }

        let policy = transition.retry.unwrap_or(self.default_retry);
        let mut backoff = policy.backoff();

        loop {
            if self.shutdown.hard_requested() {
                info!(name = self.name, ?action, "Hard stop requested, cancelling transition");
                return Err(FsmError::Cancelled);
            }

            match (transition.run)(&mut state.data).await {
                Ok(()) => {
                    debug!(
                        name = self.name,
                        ?action,
                        from = ?transition.from,
                        to = ?transition.to,
                        "Transition completed"
                    );
                    state.id = transition.to;
                    return Ok(());
                }
                Err(TransitionError::Unrecoverable(err)) => {
                    error!(name = self.name, ?action, error = %err, "Unrecoverable error, not retrying");
                    return Err(FsmError::Unrecoverable(err));
                }
                Err(TransitionError::Retryable(err)) => {
                    let Some(wait) = backoff.next_wait() else {
                        error!(name = self.name, ?action, error = %err, "Retry attempts exhausted");
                        return Err(FsmError::RetryAttemptsExhausted(err));
                    };

                    info!(name = self.name, ?action, ?wait, error = %err, "Transition failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.hard_cancelled() => {
                            return Err(FsmError::Cancelled);
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Run actions in order; the first failure aborts. A soft stop request is
    /// honored between actions, letting the in-flight transition finish.
    pub async fn run_sequence(
        &self,
        actions: impl IntoIterator<Item = A>,
    ) -> Result<(), FsmError> {
        for action in actions {
            if self.shutdown.soft_requested() {
                warn!(name = self.name, ?action, "Soft stop requested, aborting sequence");
                return Err(FsmError::Cancelled);
            }
            self.run(action).await?;
        }
        Ok(())
    }

    pub async fn state_id(&self) -> S {
        self.state.lock().await.id
    }

    /// Read the FSM data under the state lock.
    pub async fn with_data<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.state.lock().await.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestState {
        Start,
        Middle,
        End,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestAction {
        Advance,
        Finish,
        Flaky,
        Doomed,
        Broken,
    }

    struct TestData {
        runs: u32,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            wait_increment: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
        }
    }

    fn test_fsm(shutdown: Shutdown) -> Fsm<TestState, TestAction, TestData> {
        let flaky_attempts = Arc::new(AtomicU32::new(0));

        let mut transitions = HashMap::new();
        transitions.insert(
            TestAction::Advance,
            Transition::new(TestState::Start, TestState::Middle, |data: &mut TestData| -> TransitionFuture<'_> {
                Box::pin(async move {
                    data.runs += 1;
                    Ok(())
                })
            }),
        );
        transitions.insert(
            TestAction::Finish,
            Transition::new(TestState::Middle, TestState::End, |data: &mut TestData| -> TransitionFuture<'_> {
                Box::pin(async move {
                    data.runs += 1;
                    Ok(())
                })
            }),
        );
        transitions.insert(
            TestAction::Flaky,
            Transition::new(TestState::Start, TestState::Middle, {
                let attempts = flaky_attempts.clone();
                move |data: &mut TestData| -> TransitionFuture<'_> {
                    let attempts = attempts.clone();
                    Box::pin(async move {
                        data.runs += 1;
                        // Fail twice, then succeed.
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(TransitionError::retryable(std::io::Error::other(
                                "transient",
                            )));
                        }
                        Ok(())
                    })
                }
            }),
        );
        transitions.insert(
            TestAction::Doomed,
            Transition::new(TestState::Start, TestState::Middle, |data: &mut TestData| -> TransitionFuture<'_> {
                Box::pin(async move {
                    data.runs += 1;
                    Err(TransitionError::retryable(std::io::Error::other("always")))
                })
            }),
        );
        transitions.insert(
            TestAction::Broken,
            Transition::new(TestState::Start, TestState::Middle, |data: &mut TestData| -> TransitionFuture<'_> {
                Box::pin(async move {
                    data.runs += 1;
                    Err(TransitionError::unrecoverable_msg("invariant violated"))
                })
            }),
        );

        Fsm::new(
            "test",
            TestState::Start,
            TestData { runs: 0 },
            transitions,
            policy(),
            shutdown,
        )
    }

    #[tokio::test]
    async fn test_run_advances_state() {
        let fsm = test_fsm(Shutdown::new());
        fsm.run(TestAction::Advance).await.unwrap();
        assert_eq!(fsm.state_id().await, TestState::Middle);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let fsm = test_fsm(Shutdown::new());
        let err = fsm.run(TestAction::Finish).await.unwrap_err();
        assert!(matches!(err, FsmError::InvalidTransition { .. }));
        assert_eq!(fsm.state_id().await, TestState::Start);
    }

    #[tokio::test]
    async fn test_retryable_failure_retries_until_success() {
        let fsm = test_fsm(Shutdown::new());
        fsm.run(TestAction::Flaky).await.unwrap();
        assert_eq!(fsm.state_id().await, TestState::Middle);
        assert_eq!(fsm.with_data(|d| d.runs).await, 3);
    }

    #[tokio::test]
    async fn test_retry_attempts_exhausted() {
        let fsm = test_fsm(Shutdown::new());
        let err = fsm.run(TestAction::Doomed).await.unwrap_err();
        assert!(matches!(err, FsmError::RetryAttemptsExhausted(_)));
        // Initial attempt plus max_retries.
        assert_eq!(fsm.with_data(|d| d.runs).await, 4);
        assert_eq!(fsm.state_id().await, TestState::Start);
    }

    #[tokio::test]
    async fn test_unrecoverable_short_circuits() {
        let fsm = test_fsm(Shutdown::new());
        let err = fsm.run(TestAction::Broken).await.unwrap_err();
        assert!(matches!(err, FsmError::Unrecoverable(_)));
        assert_eq!(fsm.with_data(|d| d.runs).await, 1);
    }

    #[tokio::test]
    async fn test_run_sequence_in_order() {
        let fsm = test_fsm(Shutdown::new());
        fsm.run_sequence([TestAction::Advance, TestAction::Finish])
            .await
            .unwrap();
        assert_eq!(fsm.state_id().await, TestState::End);
    }

    #[tokio::test]
    async fn test_run_sequence_aborts_on_failure() {
        let fsm = test_fsm(Shutdown::new());
        let err = fsm
            .run_sequence([TestAction::Broken, TestAction::Finish])
            .await
            .unwrap_err();
        assert!(matches!(err, FsmError::Unrecoverable(_)));
        assert_eq!(fsm.state_id().await, TestState::Start);
    }

    #[tokio::test]
    async fn test_soft_stop_aborts_sequence() {
        let shutdown = Shutdown::new();
        shutdown.request_soft();
        let fsm = test_fsm(shutdown);
        let err = fsm
            .run_sequence([TestAction::Advance, TestAction::Finish])
            .await
            .unwrap_err();
        assert!(matches!(err, FsmError::Cancelled));
        assert_eq!(fsm.state_id().await, TestState::Start);
    }

    #[tokio::test]
    async fn test_hard_stop_cancels_run() {
        let shutdown = Shutdown::new();
        shutdown.request_hard();
        let fsm = test_fsm(shutdown);
        let err = fsm.run(TestAction::Advance).await.unwrap_err();
        assert!(matches!(err, FsmError::Cancelled));
    }
}
