//! The graph: operator ownership plus the shared services every operator
//! sees (worker pool, memory manager, configuration).

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::cache::MemoryManager;
use crate::error::{LazyflowError, Result};
use crate::request::ThreadPool;

use super::node::{OperatorHandle, OperatorNode};
use super::operator::Operator;

/// Default target size of one cache block in bytes.
pub const DEFAULT_BLOCK_BYTES: usize = 1 << 20;

/// Worker count used when none is configured.
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

/// Engine-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphConfig {
    /// Worker threads; 0 runs every request synchronously.
    pub threads: usize,
    /// Soft cap on cached bytes across all caches; `None` disables eviction.
    pub memory_budget: Option<usize>,
    /// Target bytes per cache block when no block shape is given.
    pub default_block_bytes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            memory_budget: None,
            default_block_bytes: DEFAULT_BLOCK_BYTES,
        }
    }
}

impl GraphConfig {
    /// Synchronous configuration (no worker threads), handy in tests.
    pub fn synchronous() -> Self {
        Self {
            threads: 0,
            ..Self::default()
        }
    }

    /// Set the worker count.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the memory budget in bytes.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

/// Services shared by every operator of one graph.
pub struct GraphContext {
    config: GraphConfig,
    pool: ThreadPool,
    memory: MemoryManager,
    finalized: AtomicBool,
}

impl GraphContext {
    /// Settings the graph was built with.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Worker pool.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Memory manager.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// True after [`Graph::finalize`].
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

/// Owner of top-level operators.
///
/// Dropping the graph finalizes it.
pub struct Graph {
    context: Arc<GraphContext>,
    operators: Mutex<Vec<OperatorHandle>>,
}

impl Graph {
    /// Create a graph, spawning its worker pool.
    pub fn new(config: GraphConfig) -> Self {
        tracing::debug!(
            "graph_new: {} threads, budget {:?}, block {} bytes",
            config.threads,
            config.memory_budget,
            config.default_block_bytes
        );
        let pool = ThreadPool::new(config.threads);
        let memory = MemoryManager::new(config.memory_budget);
        Self {
            context: Arc::new(GraphContext {
                config,
                pool,
                memory,
                finalized: AtomicBool::new(false),
            }),
            operators: Mutex::new(Vec::new()),
        }
    }

    /// Shared services.
    pub fn context(&self) -> &Arc<GraphContext> {
        &self.context
    }

    /// Memory manager.
    pub fn memory(&self) -> &MemoryManager {
        &self.context.memory
    }

    /// Add a top-level operator.
    pub fn add(&self, op: impl Operator) -> Result<OperatorHandle> {
        self.add_boxed(Box::new(op))
    }

    /// Add a boxed top-level operator.
    pub fn add_boxed(&self, op: Box<dyn Operator>) -> Result<OperatorHandle> {
        if self.context.is_finalized() {
            return Err(LazyflowError::Finalized);
        }
        let handle = OperatorNode::create(Arc::clone(&self.context), Weak::new(), op)?;
        self.operators.lock().push(handle.clone());
        Ok(handle)
    }

    /// Close and remove an operator (and its children).
    pub fn remove(&self, handle: &OperatorHandle) {
        self.operators.lock().retain(|h| h != handle);
        handle.node().close();
    }

    /// Top-level operators in insertion order.
    pub fn operators(&self) -> Vec<OperatorHandle> {
        self.operators.lock().clone()
    }

    /// Stop accepting requests, drain the pool and close every operator.
    pub fn finalize(&self) {
        if self.context.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.pool.finalize();
        let operators = std::mem::take(&mut *self.operators.lock());
        for handle in operators.iter().rev() {
            handle.node().close();
        }
        tracing::debug!("graph_finalized");
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.finalize();
    }
}
