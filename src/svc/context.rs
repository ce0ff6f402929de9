//! # Context module
//!
//! This module provides the ambient state of one resync run or one live
//! event. The context is passed explicitly through every pipeline stage and
//! into user hooks instead of living in task-local storage.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// RunContext structure

#[derive(Clone, Debug)]
pub struct RunContext {
    /// correlates every log event, metric and catalog write of one run
    pub trace_id: String,
    pub config: Arc<Configuration>,
    cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self::with_token(config, CancellationToken::new())
    }

    pub fn with_token(config: Arc<Configuration>, cancellation: CancellationToken) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            config,
            cancellation,
        }
    }

    /// returns a context scoped to a sub-task of this run. It shares the
    /// trace identifier and is cancelled alongside its parent
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.to_owned(),
            config: self.config.to_owned(),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::RunContext;
    use crate::svc::cfg::tests_support::configuration;

    #[test]
    fn child_should_share_trace_and_follow_cancellation() {
        let ctx = RunContext::new(Arc::new(configuration()));
        let child = ctx.child();

        assert_eq!(ctx.trace_id, child.trace_id);
        assert!(!child.is_cancelled());

        ctx.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_should_not_cancel_parent() {
        let ctx = RunContext::new(Arc::new(configuration()));
        let child = ctx.child();

        child.cancel();
        assert!(!ctx.is_cancelled());
    }
}
