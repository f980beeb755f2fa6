//! The job transition table.

use chrono::Utc;
use futures::future::BoxFuture;
use pipewright_core::Error;
use pipewright_core::agent::Cmd;
use pipewright_core::event::JobEvent;
use pipewright_core::job::JobStatus::{self, *};
use pipewright_core::step::StepStatus;
use tracing::{debug, info, warn};

use crate::context::JobSmContext;
use crate::manager::JobActionManager;
use crate::sm::{Guarded, Next, StateMachine, Transition};
use crate::{SmError, SmResult};

type M = JobActionManager;
type C = JobSmContext;
type Sm = StateMachine<M, C>;

const TERMINAL: [JobStatus; 4] = [Success, Failure, Timeout, Cancelled];

pub(crate) fn build() -> SmResult<Sm> {
    Sm::builder()
        .add(
            Transition::new(Pending, Loading)
                .action(load_yml)
                .on_exception(loading_failed),
        )
        .add(
            Transition::new(Pending, Created)
                .action(create)
                .on_exception(fail_from_current),
        )
        .add(
            Transition::new(Loading, Created)
                .action(create)
                .on_exception(fail_from_current),
        )
        .add(Transition::new(Pending, Failure))
        .add(Transition::new(Pending, Cancelled))
        .add(Transition::new(Loading, Failure))
        .add(
            Transition::new(Created, Queued)
                .guard(expired_before_queue)
                .action(enqueue)
                .on_exception(enqueue_failed),
        )
        .add(Transition::new(Created, Timeout))
        .add(Transition::new(Created, Failure))
        .add(Transition::new(Created, Cancelled))
        .add(
            Transition::new(Queued, Running)
                .guard(ready_to_run)
                .action(start_running)
                .on_exception(dispatch_failed),
        )
        .add(Transition::new(Queued, Cancelled))
        .add(Transition::new(Queued, Timeout))
        .add(Transition::new(Queued, Failure).action(fail_current_step))
        .add(
            Transition::new(Running, Running)
                .guard(lock_running)
                .action(continue_from_step)
                .on_exception(dispatch_failed)
                .on_finally(unlock),
        )
        .add(Transition::new(Running, Success))
        .add(
            Transition::new(Running, Failure)
                .guard(lock_unless_done)
                .action(fail_current_step)
                .on_finally(unlock),
        )
        .add(
            Transition::new(Running, Timeout)
                .guard(lock_unless_done)
                .action(stop_on_timeout)
                .on_exception(ignore_error)
                .on_finally(unlock),
        )
        .add(
            Transition::new(Running, Cancelling)
                .guard(lock_running_only)
                .action(send_kill)
                .on_exception(cancel_directly)
                .on_finally(unlock),
        )
        .add(
            Transition::new(Running, Cancelled)
                .guard(lock_unless_done)
                .on_finally(unlock),
        )
        .add(
            Transition::new(Cancelling, Cancelled)
                .guard(lock_unless_done)
                .action(record_cancelled_step)
                .on_finally(unlock),
        )
        .add(
            Transition::new(Cancelling, Timeout)
                .guard(lock_unless_done)
                .action(stop_on_timeout)
                .on_exception(ignore_error)
                .on_finally(unlock),
        )
        .on_entering(Cancelled, ensure_not_busy)
        .on_settled(&TERMINAL, finish)
        .build()
}

fn load_yml<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        m.set_status_and_save(&mut ctx.job, Loading, None).await?;
        let yml = m.fetcher.fetch(&ctx.job).await?;
        ctx.yml = Some(yml);
        Ok(Next::To(Created))
    })
}

fn loading_failed<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let SmError::JobFinished(_) = err {
            return Err(err);
        }
        warn!(job_id = %ctx.job.id, error = %err, "unable to load yaml");
        ctx.error = Some(err.to_string());
        Ok(Next::Jump(Loading, Failure))
    })
}

fn create<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        let yml = ctx
            .yml
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("no yaml for job {}", ctx.job.id)))?;

        let tree = m.ymls.create(&ctx.job, &yml).await?;
        m.steps.init(&ctx.job, &tree).await?;

        let root = tree.root();
        ctx.job.context.merge(&root.attrs.envs, false);
        ctx.job.current_path = Some(root.path_str());
        m.set_status_and_save(&mut ctx.job, Created, None).await?;
        Ok(Next::Done)
    })
}

/// Route to FAILURE from the status the failed transition started at.
fn fail_from_current<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let SmError::JobFinished(_) = err {
            return Err(err);
        }
        warn!(job_id = %ctx.job.id, from = %ctx.from, to = %ctx.to, error = %err, "transition failed");
        ctx.error = Some(err.to_string());
        Ok(Next::Jump(ctx.from, Failure))
    })
}

fn expired_before_queue<'a>(_: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Guarded>> {
    Box::pin(async move {
        if ctx.job.is_expired(Utc::now()) {
            ctx.error = Some("Job expired before it was queued".to_string());
            return Ok(Guarded::Redirect(Timeout));
        }
        Ok(Guarded::Proceed)
    })
}

fn enqueue<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        m.set_status_and_save(&mut ctx.job, Queued, None).await?;
        let queue = ctx.job.queue_name(&m.config.queue_prefix);
        m.queue
            .send(&queue, ctx.job.id.to_bytes(), ctx.job.priority, ctx.job.expire_at())
            .await?;
        debug!(job_id = %ctx.job.id, queue = %queue, "job queued");
        Ok(Next::Done)
    })
}

fn enqueue_failed<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let SmError::JobFinished(_) = err {
            return Err(err);
        }
        ctx.error = Some(format!("Unable to enqueue: {err}"));
        Ok(Next::Jump(Created, Failure))
    })
}

fn ready_to_run<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Guarded>> {
    Box::pin(async move {
        ctx.job = m.jobs.get(ctx.job.id).await?;
        if ctx.job.status != Queued {
            debug!(job_id = %ctx.job.id, status = %ctx.job.status, "job is no longer queued");
            return Ok(Guarded::Skip);
        }
        if ctx.job.is_expired(Utc::now()) {
            ctx.error = Some("Job expired while queued".to_string());
            return Ok(Guarded::Redirect(Timeout));
        }
        Ok(Guarded::Proceed)
    })
}

fn start_running<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        let job_id = ctx.job.id;
        m.events.publish(JobEvent::Received(job_id));

        let agent = m.agents.acquire(&ctx.job, m.can_acquire(job_id)).await?;
        let Some(agent) = agent else {
            ctx.job = m.jobs.get(job_id).await?;
            if ctx.job.status == Queued && ctx.job.is_expired(Utc::now()) {
                ctx.error = Some("Job expired while waiting for an agent".to_string());
                return Ok(Next::Jump(Queued, Timeout));
            }
            debug!(job_id = %job_id, status = %ctx.job.status, "stopped waiting for an agent");
            return Ok(Next::Done);
        };

        info!(job_id = %job_id, agent = %agent.name, "agent acquired");
        ctx.agent_id = Some(agent.id);
        ctx.job.agent_id = Some(agent.id);
        ctx.job.started_at = Some(Utc::now());
        m.set_status_and_save(&mut ctx.job, Running, None).await?;

        let tree = m.ymls.get_tree(&ctx.job).await?;
        let first = tree.next(&tree.root().path_str())?;
        if m.execute_node(ctx, &tree, first).await? {
            return Ok(Next::Done);
        }
        Ok(Next::To(m.finish_status(ctx)))
    })
}

fn dispatch_failed<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let SmError::JobFinished(_) = err {
            return Err(err);
        }
        warn!(job_id = %ctx.job.id, path = ?ctx.job.current_path, error = %err, "dispatch failed");
        ctx.error = Some(err.to_string());
        let from = if ctx.job.status == Running { Running } else { Queued };
        Ok(Next::Jump(from, Failure))
    })
}

fn fail_current_step<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        mark_current_step(m, ctx, StepStatus::Exception).await?;
        Ok(Next::Done)
    })
}

async fn mark_current_step(m: &M, ctx: &mut C, status: StepStatus) -> SmResult<()> {
    let Some(path) = ctx.job.current_path.clone() else {
        return Ok(());
    };
    let mut step = match m.steps.get(ctx.job.id, &path).await {
        Ok(step) => step,
        // the cursor sits on the root until the first step is dispatched
        Err(SmError::Db(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    if !step.status.is_finished() {
        let error = ctx.error.clone();
        m.steps.to_status(&mut step, status, error.as_deref()).await?;
    }
    Ok(())
}

fn lock_running<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Guarded>> {
    Box::pin(async move {
        m.lock_and_reload(ctx).await?;
        if ctx.job.is_done() {
            return Err(SmError::JobFinished(ctx.job.id));
        }
        if ctx.job.status != Running {
            return Err(SmError::UnexpectedStatus {
                job: ctx.job.id,
                expected: Running,
                actual: ctx.job.status,
            });
        }
        Ok(Guarded::Proceed)
    })
}

fn lock_unless_done<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Guarded>> {
    Box::pin(async move {
        m.lock_and_reload(ctx).await?;
        if ctx.job.is_done() {
            return Ok(Guarded::Skip);
        }
        Ok(Guarded::Proceed)
    })
}

fn lock_running_only<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Guarded>> {
    Box::pin(async move {
        m.lock_and_reload(ctx).await?;
        if ctx.job.status != Running {
            debug!(job_id = %ctx.job.id, status = %ctx.job.status, "job is not running, nothing to cancel");
            return Ok(Guarded::Skip);
        }
        Ok(Guarded::Proceed)
    })
}

fn unlock<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        if let Some(handle) = ctx.lock.take() {
            let path = handle.path.clone();
            match m.lock.release(handle).await {
                Ok(()) => debug!(job_id = %ctx.job.id, path = %path, "job unlocked"),
                Err(e) => warn!(job_id = %ctx.job.id, path = %path, error = %e, "unable to unlock job"),
            }
        }
    })
}

fn continue_from_step<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(m.continue_from_step(ctx))
}

fn stop_on_timeout<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        // a step result already carries its own timeout; otherwise the job
        // ran out of time and the agent has to stop
        if ctx.step.is_none() {
            if let Some(agent_id) = ctx.job.agent_id {
                let agent = m.agents.get(agent_id).await?;
                if agent.is_online() {
                    m.agents.dispatch(Cmd::Kill { job_id: ctx.job.id }, &agent).await?;
                }
            }
            ctx.error.get_or_insert_with(|| "Job run timed out".to_string());
        }
        mark_current_step(m, ctx, StepStatus::Timeout).await?;
        Ok(Next::Done)
    })
}

fn ignore_error<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        warn!(job_id = %ctx.job.id, from = %ctx.from, to = %ctx.to, error = %err, "ignoring error");
        Ok(Next::Done)
    })
}

fn send_kill<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        let message = ctx.reason.clone();
        m.set_status_and_save(&mut ctx.job, Cancelling, message).await?;

        let agent_id = ctx
            .job
            .agent_id
            .ok_or_else(|| Error::NotAvailable(format!("job {} has no agent", ctx.job.id)))?;
        let agent = m.agents.get(agent_id).await?;
        m.agents.dispatch(Cmd::Kill { job_id: ctx.job.id }, &agent).await?;
        info!(job_id = %ctx.job.id, agent = %agent.name, "kill sent");
        Ok(Next::Done)
    })
}

fn cancel_directly<'a>(_: &'a M, ctx: &'a mut C, err: SmError) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let SmError::JobFinished(_) = err {
            return Err(err);
        }
        warn!(job_id = %ctx.job.id, error = %err, "unable to stop the agent, cancelling directly");
        Ok(Next::Jump(Running, Cancelled))
    })
}

fn record_cancelled_step<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<Next>> {
    Box::pin(async move {
        if let Some(step) = ctx.step.clone() {
            let tree = m.ymls.get_tree(&ctx.job).await?;
            m.record_step(ctx, &tree, &step).await?;
        }
        Ok(Next::Done)
    })
}

/// A job being advanced under its lock cannot be cancelled from outside.
fn ensure_not_busy<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<()>> {
    Box::pin(async move {
        if ctx.lock.is_none() && m.lock.exists(&ctx.job.lock_path()).await? {
            return Err(SmError::TryLater(ctx.job.id));
        }
        Ok(())
    })
}

fn finish<'a>(m: &'a M, ctx: &'a mut C) -> BoxFuture<'a, SmResult<()>> {
    Box::pin(m.finish(ctx))
}
