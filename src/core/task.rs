use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::step::StepResult;
use crate::errors::{ProviderError, ProviderResult, TaskError};
use crate::proxmox::{ProxmoxApi, TaskStatus, Upid};

const MIN_WAIT_PERIOD: Duration = Duration::from_millis(100);

/// State of a remote task after one refresh.
#[derive(Debug)]
pub enum TaskPoll {
    Running,
    Succeeded,
    Failed(TaskError),
}

impl TaskPoll {
    pub fn from_status(upid: &Upid, status: TaskStatus) -> Self {
        if status.is_running() {
            TaskPoll::Running
        } else if status.is_successful() {
            TaskPoll::Succeeded
        } else {
            TaskPoll::Failed(TaskError::Failed {
                upid: upid.to_string(),
                status: status.status,
                exit_status: status.exitstatus,
            })
        }
    }

    /// Step outcome for a task a forward step is waiting on.
    pub fn into_step(self, retry: Duration) -> ProviderResult<StepResult> {
        match self {
            TaskPoll::Running => Ok(StepResult::RetryAfter(retry)),
            TaskPoll::Succeeded => Ok(StepResult::Continue),
            TaskPoll::Failed(err) => Err(err.into()),
        }
    }
}

/// Refreshes the task once.
pub async fn poll<A: ProxmoxApi + ?Sized>(api: &A, upid: &Upid) -> ProviderResult<TaskPoll> {
    let status = api.task_status(upid).await?;
    debug!(task = %upid, status = %status.status, "task status");
    Ok(TaskPoll::from_status(upid, status))
}

/// Blocks until the task finishes, checking every `every` starting one period
/// from now. Returns as soon as `cancel` fires, including mid-request.
pub async fn wait_for_task<A: ProxmoxApi + ?Sized>(
    api: &A,
    upid: &Upid,
    every: Duration,
    cancel: &CancellationToken,
) -> ProviderResult<()> {
    // tokio panics on a zero period
    let every = every.max(MIN_WAIT_PERIOD);
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(upid)),
            _ = ticker.tick() => {}
        }

        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(upid)),
            state = poll(api, upid) => state?,
        };

        match state {
            TaskPoll::Running => continue,
            TaskPoll::Succeeded => return Ok(()),
            TaskPoll::Failed(err) => return Err(err.into()),
        }
    }
}

fn cancelled(upid: &Upid) -> ProviderError {
    ProviderError::Cancelled(format!("stopped waiting for task {upid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upid() -> Upid {
        Upid::from("UPID:pve1:00001234:00ABCDEF:65000000:qmstop:100:root@pam:")
    }

    fn status(status: &str, exit: Option<&str>) -> TaskStatus {
        TaskStatus {
            status: status.to_string(),
            exitstatus: exit.map(str::to_string),
        }
    }

    #[test]
    fn test_classification() {
        assert!(matches!(
            TaskPoll::from_status(&upid(), status("running", None)),
            TaskPoll::Running
        ));
        assert!(matches!(
            TaskPoll::from_status(&upid(), status("stopped", Some("OK"))),
            TaskPoll::Succeeded
        ));

        match TaskPoll::from_status(&upid(), status("stopped", Some("command failed"))) {
            TaskPoll::Failed(err) => assert_eq!(err.status(), Some("stopped")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reduction() {
        let retry = Duration::from_secs(10);
        assert!(matches!(
            TaskPoll::Running.into_step(retry),
            Ok(StepResult::RetryAfter(d)) if d == retry
        ));
        assert!(matches!(TaskPoll::Succeeded.into_step(retry), Ok(StepResult::Continue)));

        let failed = TaskPoll::Failed(TaskError::Failed {
            upid: upid().to_string(),
            status: "stopped".into(),
            exit_status: None,
        });
        assert_eq!(failed.into_step(retry).unwrap_err().to_string(), "stopped");
    }
}
