use log::trace;
use std::sync::Arc;

use crate::commands::{Command, ReturnValue};
use crate::context::InvocationContext;
use crate::errors::Result;
use crate::group::GroupManager;
use crate::interceptors::{Interceptor, Next};
use crate::key::CacheKey;
use crate::topology::RoutingKey;

/// Routes grouped keys by their group.
///
/// Installed only when grouping is enabled. Resolves the group of every key
/// written by a put, remove or put-all, or by the writes of a delivered
/// prepare, and records the group as the routing target of the invocation.
/// Invalid group declarations fail the command here, before anything is sent.
pub struct GroupingInterceptor {
    groups: Arc<GroupManager>,
}

impl GroupingInterceptor {
    pub fn new(groups: Arc<GroupManager>) -> Self {
        Self { groups }
    }

    fn route_keys<'k>(
        &self,
        ctx: &mut InvocationContext,
        keys: impl Iterator<Item = &'k CacheKey>,
    ) -> Result<()> {
        for key in keys {
            if let Some(group) = self.groups.get_group(key)? {
                trace!("Routing {:?} by group '{}'", key, group);
                ctx.route(key.clone(), RoutingKey::Group(group));
            }
        }
        Ok(())
    }
}

impl Interceptor for GroupingInterceptor {
    fn name(&self) -> &'static str {
        "grouping"
    }

    fn handle(
        &self,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> Result<ReturnValue> {
        match &command {
            Command::Put(put) => self.route_keys(ctx, std::iter::once(&put.key))?,
            Command::Remove(remove) => self.route_keys(ctx, std::iter::once(&remove.key))?,
            Command::PutAll(put_all) => self.route_keys(ctx, put_all.keys())?,
            Command::Prepare(prepare) => self.route_keys(ctx, prepare.affected_keys.iter())?,
            // Clear reaches every member regardless of groups.
            Command::Clear(_) => {}
            Command::Commit(_) | Command::Rollback(_) | Command::LockControl(_) => {}
        }
        next.invoke(ctx, command)
    }
}
