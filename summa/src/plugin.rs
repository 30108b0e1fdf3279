//! Plugin registration, dependency ordering and operation hooks.
//!
//! Plugins contribute background workers and before/after hooks around the
//! mutation operations. Initialization order is a topological sort of the
//! declared dependencies; ties break on plugin id so the order is stable
//! across runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::LedgerError;
use crate::scheduler::Worker;
use crate::store::LedgerId;
use crate::telemetry::log_error;

/// The mutation operations hooks can attach to.
pub const OPERATIONS: &[&str] = &[
    "accounts.create",
    "accounts.freeze",
    "accounts.unfreeze",
    "accounts.close",
    "transactions.credit",
    "transactions.debit",
    "transactions.transfer",
    "transactions.multi_transfer",
    "transactions.refund",
    "transactions.correct",
    "transactions.adjust",
    "transactions.journal",
    "holds.create",
    "holds.commit",
    "holds.void",
];

/// What a hook sees about the operation it wraps.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: String,
    pub ledger_id: LedgerId,
    /// Request summary; hooks must not assume any particular shape beyond
    /// the operation's documented payload.
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait OperationHook: Send + Sync {
    async fn call(&self, op: &OperationContext) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookMatcher {
    All,
    Exact(String),
    /// Matches a namespace, e.g. `transactions.` for every mutation in the
    /// transaction manager.
    Prefix(String),
}

impl HookMatcher {
    fn matches(&self, operation: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(name) => name == operation,
            Self::Prefix(prefix) => operation.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// Runs inside the mutation; a failure aborts and rolls back.
    Before,
    /// Runs after commit; a failure is logged and does not undo the work.
    After,
}

pub struct HookRegistration {
    pub matcher: HookMatcher,
    pub stage: HookStage,
    pub hook: Arc<dyn OperationHook>,
}

pub struct PluginInitContext {
    pub pool: PgPool,
    pub ledger_id: LedgerId,
}

#[async_trait]
pub trait Plugin: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn init(&self, _ctx: &PluginInitContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn workers(&self) -> Vec<Arc<dyn Worker>> {
        Vec::new()
    }

    fn operation_hooks(&self) -> Vec<HookRegistration> {
        Vec::new()
    }
}

/// Validate the plugin set and return it in initialization order.
///
/// Rejects duplicate ids and dependencies on absent plugins; Kahn's
/// algorithm orders the rest, and any residual after the sort is a
/// dependency cycle.
pub fn topological_order(
    plugins: &[Arc<dyn Plugin>],
) -> Result<Vec<Arc<dyn Plugin>>, LedgerError> {
    let mut by_id: BTreeMap<&str, &Arc<dyn Plugin>> = BTreeMap::new();
    for plugin in plugins {
        if by_id.insert(plugin.id(), plugin).is_some() {
            return Err(LedgerError::InvalidArgument(format!(
                "duplicate plugin id: {}",
                plugin.id()
            )));
        }
    }
    for plugin in plugins {
        for dep in plugin.dependencies() {
            if !by_id.contains_key(dep.as_str()) {
                return Err(LedgerError::InvalidArgument(format!(
                    "plugin {} depends on missing plugin {dep}",
                    plugin.id()
                )));
            }
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<String, Vec<&str>> = HashMap::new();
    for plugin in plugins {
        let deps = plugin.dependencies();
        in_degree.insert(plugin.id(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(plugin.id());
        }
    }

    // BTreeMap iteration keeps the ready set in id order, so the output is
    // deterministic regardless of registration order.
    let mut ordered = Vec::with_capacity(plugins.len());
    let mut done: HashSet<&str> = HashSet::new();
    while ordered.len() < plugins.len() {
        let Some(next) = in_degree
            .iter()
            .find(|(id, degree)| **degree == 0 && !done.contains(**id))
            .map(|(id, _)| *id)
        else {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(id, _)| !done.contains(*id))
                .map(|(id, _)| *id)
                .collect();
            return Err(LedgerError::InvalidArgument(format!(
                "plugin dependency cycle involving: {}",
                stuck.join(", ")
            )));
        };
        done.insert(next);
        ordered.push(Arc::clone(by_id[next]));
        if let Some(children) = dependents.get(next) {
            for child in children {
                *in_degree.get_mut(child).expect("registered above") -= 1;
            }
        }
    }
    Ok(ordered)
}

/// Hooks pre-resolved per (operation, stage) so dispatch on the mutation
/// hot path is a single map lookup.
#[derive(Default, Clone)]
pub struct HookIndex {
    hooks: HashMap<(String, HookStage), Vec<Arc<dyn OperationHook>>>,
}

impl HookIndex {
    pub fn build(plugins: &[Arc<dyn Plugin>]) -> Self {
        let mut hooks: HashMap<_, Vec<Arc<dyn OperationHook>>> =
            HashMap::new();
        for plugin in plugins {
            for registration in plugin.operation_hooks() {
                for operation in OPERATIONS {
                    if registration.matcher.matches(operation) {
                        hooks
                            .entry((
                                operation.to_string(),
                                registration.stage,
                            ))
                            .or_default()
                            .push(Arc::clone(&registration.hook));
                    }
                }
            }
        }
        Self { hooks }
    }

    fn get(
        &self,
        operation: &str,
        stage: HookStage,
    ) -> &[Arc<dyn OperationHook>] {
        self.hooks
            .get(&(operation.to_string(), stage))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Run before-hooks; the first failure aborts the mutation.
    pub async fn run_before(
        &self,
        op: &OperationContext,
    ) -> Result<(), LedgerError> {
        for hook in self.get(&op.operation, HookStage::Before) {
            hook.call(op).await.map_err(LedgerError::Internal)?;
        }
        Ok(())
    }

    /// Run after-hooks; the mutation is already committed, so failures are
    /// logged and swallowed.
    pub async fn run_after(&self, op: &OperationContext) {
        for hook in self.get(&op.operation, HookStage::After) {
            if let Err(e) = hook.call(op).await {
                log_error(e.context(format!(
                    "after-hook failed for {}",
                    op.operation
                )));
            }
        }
    }
}
