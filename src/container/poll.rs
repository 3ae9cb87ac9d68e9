//! Container Polling Loop
//!
//! Drives a created container to a terminal state. Each poll is followed
//! by a sleep of the base period scaled by a uniform factor in
//! `[0.5, 1.5]`, so many concurrent tasks do not poll in lockstep.
//! Transient backend errors are retried after one interval, up to a
//! bound; cancellation destroys the container and reports `Killed`.

use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use super::state::{ContainerHandle, ContainerState};
use super::ContainerBackend;
use crate::config::ContainerConfig;
use crate::error::Result;
use crate::scheduler::cancel::CancelToken;

/// Polling parameters taken from the container configuration.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub period: Duration,
    pub max_transient_retries: u32,
}

impl PollSettings {
    pub fn from_config(cfg: &ContainerConfig) -> Self {
        Self {
            period: Duration::from_secs_f64(cfg.polling_period_seconds),
            max_transient_retries: cfg.max_transient_retries,
        }
    }
}

/// Returns `period` scaled by a uniform random factor in `[0.5, 1.5]`.
pub fn jittered(period: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    period.mul_f64(factor)
}

/// Polls until the container reaches a terminal state.
///
/// On cancellation the container is destroyed and the handle moves to
/// `Killed`. A permanent error, or a transient one past the retry bound,
/// is returned as is.
pub fn drive(
    backend: &dyn ContainerBackend,
    handle: &mut ContainerHandle,
    settings: &PollSettings,
    cancel: &CancelToken,
) -> Result<ContainerState> {
    loop {
        if cancel.is_cancelled() {
            debug!("[{}] cancellation observed; destroying {}", handle.label, handle.id);
            if let Err(e) = backend.destroy(&handle.id) {
                warn!("[{}] failed to destroy cancelled container: {}", handle.label, e);
            }
            handle.kill();
            return Ok(handle.state());
        }

        match backend.poll(&handle.id) {
            Ok(status) => {
                handle.observe(&status)?;
                if handle.state().is_terminal() {
                    return Ok(handle.state());
                }
            }
            Err(e) if e.is_transient() && handle.transient_retries < settings.max_transient_retries => {
                handle.transient_retries += 1;
                warn!(
                    "[{}] transient backend error (retry {}/{}): {}",
                    handle.label, handle.transient_retries, settings.max_transient_retries, e
                );
            }
            Err(e) => return Err(e),
        }

        cancel.sleep(jittered(settings.period));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::{FakeBackend, FakeStep};
    use crate::container::ContainerStatus;
    use crate::error::RunError;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn settings(period_ms: u64, retries: u32) -> PollSettings {
        PollSettings {
            period: Duration::from_millis(period_ms),
            max_transient_retries: retries,
        }
    }

    fn running() -> FakeStep {
        FakeStep::Status(ContainerStatus::new(ContainerState::Running))
    }

    #[test]
    fn test_jitter_bounds() {
        let period = Duration::from_secs_f64(1.5);
        for _ in 0..1000 {
            let d = jittered(period);
            assert!(d >= Duration::from_secs_f64(0.75), "{:?}", d);
            assert!(d <= Duration::from_secs_f64(2.25), "{:?}", d);
        }
    }

    #[test]
    fn test_poll_interval_within_jitter_bounds() {
        let backend = FakeBackend::new();
        backend.script("t", vec![running(), running(), FakeStep::Status(ContainerStatus::exited(0))]);
        let id = backend.create_for_test("t");
        let mut handle = ContainerHandle::new(&id, "call-t");

        let state = drive(&backend, &mut handle, &settings(1500, 0), &CancelToken::new()).unwrap();
        assert_eq!(state, ContainerState::Succeeded);

        let polls = backend.poll_times("t");
        assert_eq!(polls.len(), 3);
        for pair in polls.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(750), "{:?}", gap);
            assert!(gap <= Duration::from_millis(2250 + 100), "{:?}", gap);
        }
    }

    #[test]
    fn test_transient_errors_retried() {
        let backend = FakeBackend::new();
        backend.script(
            "t",
            vec![
                FakeStep::Transient,
                FakeStep::Transient,
                FakeStep::Status(ContainerStatus::exited(0)),
            ],
        );
        let id = backend.create_for_test("t");
        let mut handle = ContainerHandle::new(&id, "call-t");

        let state = drive(&backend, &mut handle, &settings(10, 2), &CancelToken::new()).unwrap();
        assert_eq!(state, ContainerState::Succeeded);
        assert_eq!(handle.transient_retries, 2);
    }

    #[test]
    fn test_retry_bound_exceeded() {
        let backend = FakeBackend::new();
        backend.script("t", vec![FakeStep::Transient]);
        let id = backend.create_for_test("t");
        let mut handle = ContainerHandle::new(&id, "call-t");

        let err = drive(&backend, &mut handle, &settings(10, 3), &CancelToken::new()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(handle.transient_retries, 3);
        assert_eq!(backend.poll_times("t").len(), 4);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let backend = FakeBackend::new();
        backend.script("t", vec![FakeStep::Permanent]);
        let id = backend.create_for_test("t");
        let mut handle = ContainerHandle::new(&id, "call-t");

        let err = drive(&backend, &mut handle, &settings(10, 5), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RunError::Backend { transient: false, .. }));
        assert_eq!(backend.poll_times("t").len(), 1);
    }

    #[test]
    fn test_cancel_destroys_within_interval() {
        let backend = Arc::new(FakeBackend::new());
        backend.script("t", vec![running()]);
        let id = backend.create_for_test("t");
        let cancel = CancelToken::new();

        let worker = {
            let backend = Arc::clone(&backend);
            let cancel = cancel.clone();
            thread::spawn(move || {
                let mut handle = ContainerHandle::new(&id, "call-t");
                let state = drive(backend.as_ref(), &mut handle, &settings(200, 0), &cancel).unwrap();
                (state, Instant::now())
            })
        };

        thread::sleep(Duration::from_millis(250));
        let cancelled_at = Instant::now();
        cancel.cancel();

        let (state, finished_at) = worker.join().unwrap();
        assert_eq!(state, ContainerState::Killed);
        assert!(finished_at - cancelled_at <= Duration::from_millis(300));
        assert_eq!(backend.destroyed(), vec!["t".to_string()]);
    }
}
