//! Completion handles for overlapped collectives.

use candle_core::Tensor;
use crossbeam::channel::Receiver;

use crate::error::{MoeCommError, Result};

type PostOp = Box<dyn FnOnce(Tensor) -> Result<Tensor> + Send>;

enum HandleState {
    Ready(Result<Tensor>),
    Pending(Receiver<Result<Tensor>>),
}

/// Pending result of a non-blocking collective.
///
/// The output tensor does not exist until [`CommHandle::wait`] returns; callers
/// overlap unrelated work between issuing the collective and waiting on it.
#[must_use = "an overlapped collective must be waited before its result is read"]
pub struct CommHandle {
    state: HandleState,
    post: Vec<PostOp>,
}

impl CommHandle {
    /// Handle for a collective that already completed (blocking transports,
    /// single-rank groups).
    pub fn ready(result: Result<Tensor>) -> Self {
        Self {
            state: HandleState::Ready(result),
            post: Vec::new(),
        }
    }

    pub(crate) fn pending(rx: Receiver<Result<Tensor>>) -> Self {
        Self {
            state: HandleState::Pending(rx),
            post: Vec::new(),
        }
    }

    /// Whether `wait` would return without blocking.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Pending(rx) => !rx.is_empty(),
        }
    }

    /// Queue a local transform applied to the result once it arrives.
    pub fn map<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Tensor) -> Result<Tensor> + Send + 'static,
    {
        self.post.push(Box::new(f));
        self
    }

    /// Block until the collective completes and return its output.
    pub fn wait(self) -> Result<Tensor> {
        let mut output = match self.state {
            HandleState::Ready(result) => result?,
            HandleState::Pending(rx) => rx.recv().map_err(|_| {
                MoeCommError::Transport(
                    "communication stream closed before the collective completed".to_string(),
                )
            })??,
        };
        for op in self.post {
            output = op(output)?;
        }
        Ok(output)
    }
}

impl std::fmt::Debug for CommHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommHandle")
            .field("ready", &self.is_ready())
            .field("post_ops", &self.post.len())
            .finish()
    }
}
