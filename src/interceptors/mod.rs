//! The command-interceptor pipeline.
//!
//! Every cache operation travels through an ordered chain of interceptors.
//! Each stage either answers the command itself or hands it to the rest of
//! the chain through [`Next`], optionally acting on the result on the way
//! back. The last stage applies the command to the node's data.

use log::trace;
use std::sync::Arc;

use crate::commands::{Command, ReturnValue};
use crate::context::InvocationContext;
use crate::errors::Result;

pub mod call;
pub mod distribution;
pub mod grouping;
pub mod total_order;

pub use call::CallInterceptor;
pub use distribution::DistributionInterceptor;
pub use grouping::GroupingInterceptor;
pub use total_order::TotalOrderInterceptor;

/// One stage of the pipeline.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue>;
}

/// The stages after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    /// Passes `command` to the next stage. Past the last stage it is a no-op.
    pub fn invoke(self, ctx: &mut InvocationContext, command: Command) -> Result<ReturnValue> {
        match self.rest.split_first() {
            Some((stage, rest)) => {
                trace!("{} visiting {}", command.name(), stage.name());
                stage.handle(ctx, command, Next { rest })
            }
            None => Ok(None),
        }
    }
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `interceptor` at the end of the chain.
    pub fn link(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.stages.push(interceptor);
    }

    pub fn invoke(&self, ctx: &mut InvocationContext, command: Command) -> Result<ReturnValue> {
        Next {
            rest: &self.stages,
        }
        .invoke(ctx, command)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}
