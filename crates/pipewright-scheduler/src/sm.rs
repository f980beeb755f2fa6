//! Declarative job state machine.
//!
//! Transitions are registered once in an immutable table keyed by
//! `(from, to)`. Each transition carries up to four hooks: a guard, an
//! action, an exception handler and a finally hook. Actions never call back
//! into the machine; they return [`Next`] and the driver loop applies the
//! follow-up transition itself. Finally hooks of every transition in a chain
//! run in reverse order once the chain settles, so a lock taken by the first
//! transition is held until the last one is done.

use futures::future::BoxFuture;
use pipewright_core::job::JobStatus;
use std::collections::HashMap;
use tracing::{debug, error};

use crate::{SmError, SmResult};

const MAX_HOPS: usize = 16;

/// What the driver does after an action or exception handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// The transition's target is reached.
    Done,
    /// Continue from the reached target to another status.
    To(JobStatus),
    /// Apply an explicit `(from, to)` transition, e.g. from the original
    /// status after an action failed.
    Jump(JobStatus, JobStatus),
}

/// Outcome of a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarded {
    Proceed,
    /// Apply `(from, status)` instead.
    Redirect(JobStatus),
    /// Leave the job where it is.
    Skip,
}

/// Per-run scratch state the machine can annotate.
pub trait SmContext {
    fn set_current(&mut self, from: JobStatus, to: JobStatus);
}

pub type Guard<M, C> = for<'a> fn(&'a M, &'a mut C) -> BoxFuture<'a, SmResult<Guarded>>;
pub type Action<M, C> = for<'a> fn(&'a M, &'a mut C) -> BoxFuture<'a, SmResult<Next>>;
pub type OnException<M, C> =
    for<'a> fn(&'a M, &'a mut C, SmError) -> BoxFuture<'a, SmResult<Next>>;
pub type OnFinally<M, C> = for<'a> fn(&'a M, &'a mut C) -> BoxFuture<'a, ()>;
pub type Hook<M, C> = for<'a> fn(&'a M, &'a mut C) -> BoxFuture<'a, SmResult<()>>;

pub struct Transition<M, C> {
    pub from: JobStatus,
    pub to: JobStatus,
    guard: Option<Guard<M, C>>,
    action: Option<Action<M, C>>,
    on_exception: Option<OnException<M, C>>,
    on_finally: Option<OnFinally<M, C>>,
}

impl<M, C> Transition<M, C> {
    pub fn new(from: JobStatus, to: JobStatus) -> Self {
        Self {
            from,
            to,
            guard: None,
            action: None,
            on_exception: None,
            on_finally: None,
        }
    }

    pub fn guard(mut self, guard: Guard<M, C>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: Action<M, C>) -> Self {
        self.action = Some(action);
        self
    }

    pub fn on_exception(mut self, handler: OnException<M, C>) -> Self {
        self.on_exception = Some(handler);
        self
    }

    pub fn on_finally(mut self, hook: OnFinally<M, C>) -> Self {
        self.on_finally = Some(hook);
        self
    }
}

pub struct StateMachineBuilder<M, C> {
    transitions: Vec<Transition<M, C>>,
    entering: Vec<(JobStatus, Hook<M, C>)>,
    settled: Vec<(JobStatus, Hook<M, C>)>,
}

impl<M, C> StateMachineBuilder<M, C> {
    pub fn add(mut self, transition: Transition<M, C>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Run `hook` before the action of any transition into `status`.
    pub fn on_entering(mut self, status: JobStatus, hook: Hook<M, C>) -> Self {
        self.entering.push((status, hook));
        self
    }

    /// Run `hook` once a chain settles at one of `statuses`.
    pub fn on_settled(mut self, statuses: &[JobStatus], hook: Hook<M, C>) -> Self {
        self.settled.extend(statuses.iter().map(|&s| (s, hook)));
        self
    }

    pub fn build(self) -> SmResult<StateMachine<M, C>> {
        let mut transitions = HashMap::new();
        for t in self.transitions {
            let key = (t.from, t.to);
            if transitions.insert(key, t).is_some() {
                return Err(SmError::DuplicateTransition {
                    from: key.0,
                    to: key.1,
                });
            }
        }

        let mut entering: HashMap<JobStatus, Vec<Hook<M, C>>> = HashMap::new();
        for (status, hook) in self.entering {
            entering.entry(status).or_default().push(hook);
        }
        let mut settled: HashMap<JobStatus, Vec<Hook<M, C>>> = HashMap::new();
        for (status, hook) in self.settled {
            settled.entry(status).or_default().push(hook);
        }

        Ok(StateMachine {
            transitions,
            entering,
            settled,
        })
    }
}

pub struct StateMachine<M, C> {
    transitions: HashMap<(JobStatus, JobStatus), Transition<M, C>>,
    entering: HashMap<JobStatus, Vec<Hook<M, C>>>,
    settled: HashMap<JobStatus, Vec<Hook<M, C>>>,
}

impl<M, C> StateMachine<M, C>
where
    M: Sync,
    C: SmContext + Send,
{
    pub fn builder() -> StateMachineBuilder<M, C> {
        StateMachineBuilder {
            transitions: Vec::new(),
            entering: Vec::new(),
            settled: Vec::new(),
        }
    }

    pub fn contains(&self, from: JobStatus, to: JobStatus) -> bool {
        self.transitions.contains_key(&(from, to))
    }

    /// Apply `(from, to)` and every follow-up transition it asks for.
    /// Returns the status the chain settled at.
    pub async fn execute(&self, m: &M, from: JobStatus, to: JobStatus, ctx: &mut C) -> SmResult<JobStatus> {
        let mut finals: Vec<OnFinally<M, C>> = Vec::new();
        let result = self.drive(m, from, to, ctx, &mut finals).await;
        while let Some(hook) = finals.pop() {
            hook(m, ctx).await;
        }
        result
    }

    async fn drive(
        &self,
        m: &M,
        mut from: JobStatus,
        mut to: JobStatus,
        ctx: &mut C,
        finals: &mut Vec<OnFinally<M, C>>,
    ) -> SmResult<JobStatus> {
        for _ in 0..MAX_HOPS {
            let transition = self.transitions.get(&(from, to)).ok_or_else(|| {
                error!(from = %from, to = %to, "transition is not registered");
                SmError::TransitionNotFound { from, to }
            })?;
            debug!(from = %from, to = %to, "applying transition");
            ctx.set_current(from, to);

            if let Some(hook) = transition.on_finally {
                finals.push(hook);
            }

            if let Some(guard) = transition.guard {
                match guard(m, ctx).await? {
                    Guarded::Proceed => {}
                    Guarded::Skip => return Ok(from),
                    Guarded::Redirect(status) => {
                        to = status;
                        continue;
                    }
                }
            }

            for hook in self.entering.get(&to).into_iter().flatten() {
                hook(m, ctx).await?;
            }

            let outcome = match transition.action {
                Some(action) => action(m, ctx).await,
                None => Ok(Next::Done),
            };
            let next = match (outcome, transition.on_exception) {
                (Ok(next), _) => next,
                (Err(err), Some(handler)) => handler(m, ctx, err).await?,
                (Err(err), None) => return Err(err),
            };

            match next {
                Next::Done => {
                    for hook in self.settled.get(&to).into_iter().flatten() {
                        hook(m, ctx).await?;
                    }
                    return Ok(to);
                }
                Next::To(status) => {
                    from = to;
                    to = status;
                }
                Next::Jump(jump_from, jump_to) => {
                    from = jump_from;
                    to = jump_to;
                }
            }
        }

        Err(SmError::Unsettled(from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::JobId;

    #[derive(Default)]
    struct Trace {
        steps: Vec<String>,
        status: Option<JobStatus>,
        fail_action: bool,
    }

    impl SmContext for Trace {
        fn set_current(&mut self, from: JobStatus, to: JobStatus) {
            self.steps.push(format!("{from}->{to}"));
        }
    }

    type Sm = StateMachine<(), Trace>;

    fn go_running<'a>(_: &'a (), ctx: &'a mut Trace) -> BoxFuture<'a, SmResult<Next>> {
        Box::pin(async move {
            if ctx.fail_action {
                return Err(SmError::LockUnavailable(JobId::new()));
            }
            ctx.status = Some(JobStatus::Running);
            Ok(Next::To(JobStatus::Success))
        })
    }

    fn recover<'a>(_: &'a (), ctx: &'a mut Trace, _: SmError) -> BoxFuture<'a, SmResult<Next>> {
        Box::pin(async move {
            ctx.steps.push("recover".to_string());
            Ok(Next::Jump(JobStatus::Queued, JobStatus::Failure))
        })
    }

    fn unlock<'a>(_: &'a (), ctx: &'a mut Trace) -> BoxFuture<'a, ()> {
        Box::pin(async move { ctx.steps.push("unlock".to_string()) })
    }

    fn expired<'a>(_: &'a (), _: &'a mut Trace) -> BoxFuture<'a, SmResult<Guarded>> {
        Box::pin(async move { Ok(Guarded::Redirect(JobStatus::Timeout)) })
    }

    fn finished<'a>(_: &'a (), ctx: &'a mut Trace) -> BoxFuture<'a, SmResult<()>> {
        Box::pin(async move {
            ctx.steps.push("finished".to_string());
            Ok(())
        })
    }

    fn machine() -> Sm {
        StateMachine::builder()
            .add(
                Transition::new(JobStatus::Queued, JobStatus::Running)
                    .action(go_running)
                    .on_exception(recover)
                    .on_finally(unlock),
            )
            .add(Transition::new(JobStatus::Running, JobStatus::Success))
            .add(Transition::new(JobStatus::Queued, JobStatus::Failure))
            .add(Transition::new(JobStatus::Created, JobStatus::Queued).guard(expired))
            .add(Transition::new(JobStatus::Created, JobStatus::Timeout))
            .on_settled(&[JobStatus::Success, JobStatus::Failure, JobStatus::Timeout], finished)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chained_transitions_run_finally_last() {
        let sm = machine();
        let mut ctx = Trace::default();

        let settled = sm
            .execute(&(), JobStatus::Queued, JobStatus::Running, &mut ctx)
            .await
            .unwrap();

        assert_eq!(settled, JobStatus::Success);
        assert_eq!(
            ctx.steps,
            vec!["QUEUED->RUNNING", "RUNNING->SUCCESS", "finished", "unlock"]
        );
    }

    #[tokio::test]
    async fn test_exception_handler_jumps_to_recovery() {
        let sm = machine();
        let mut ctx = Trace {
            fail_action: true,
            ..Default::default()
        };

        let settled = sm
            .execute(&(), JobStatus::Queued, JobStatus::Running, &mut ctx)
            .await
            .unwrap();

        assert_eq!(settled, JobStatus::Failure);
        assert_eq!(
            ctx.steps,
            vec!["QUEUED->RUNNING", "recover", "QUEUED->FAILURE", "finished", "unlock"]
        );
    }

    #[tokio::test]
    async fn test_guard_redirect() {
        let sm = machine();
        let mut ctx = Trace::default();

        let settled = sm
            .execute(&(), JobStatus::Created, JobStatus::Queued, &mut ctx)
            .await
            .unwrap();

        assert_eq!(settled, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_transition() {
        let sm = machine();
        let mut ctx = Trace::default();

        let result = sm
            .execute(&(), JobStatus::Success, JobStatus::Running, &mut ctx)
            .await;

        assert!(matches!(result, Err(SmError::TransitionNotFound { .. })));
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let result: SmResult<Sm> = StateMachine::builder()
            .add(Transition::new(JobStatus::Queued, JobStatus::Running))
            .add(Transition::new(JobStatus::Queued, JobStatus::Running))
            .build();
        assert!(matches!(result, Err(SmError::DuplicateTransition { .. })));
    }
}
