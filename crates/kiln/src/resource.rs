use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::exception_private::{ExcType, RunError, SimpleException};

/// Recommended maximum recursion depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Extra frames allowed past the recursion limit while a `RecursionError` unwinds.
///
/// Handlers that run during the unwind may call functions of their own; exceeding
/// the limit by more than this is treated as unrecoverable.
pub const RECURSION_HEADROOM: usize = 50;

/// Maximum nesting followed by `repr()` and structural equality before giving up.
///
/// Separate from the call stack limit; protects against self-referencing containers.
pub const MAX_DATA_RECURSION_DEPTH: u16 = 200;

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum instruction operations exceeded.
    Operation { limit: usize, count: usize },
    /// Maximum execution time exceeded.
    Time { limit: Duration, elapsed: Duration },
    /// Maximum memory usage exceeded.
    Memory { limit: usize, used: usize },
    /// Maximum recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => write!(f, "allocation limit exceeded: {count} > {limit}"),
            Self::Operation { limit, count } => write!(f, "operation limit exceeded: {count} > {limit}"),
            Self::Time { limit, elapsed } => write!(f, "time limit exceeded: {elapsed:?} > {limit:?}"),
            Self::Memory { limit, used } => write!(f, "memory limit exceeded: {used} bytes > {limit} bytes"),
            Self::Recursion { .. } => f.write_str("maximum recursion depth exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Maps a resource error onto the exception kind raised inside the VM.
    ///
    /// - `Allocation`, `Memory` → `MemoryError`
    /// - `Operation`, `Time` → `TimeoutError`
    /// - `Recursion` → `RecursionError`
    #[must_use]
    pub(crate) fn into_simple_exception(self) -> SimpleException {
        let exc_type = match self {
            Self::Allocation { .. } | Self::Memory { .. } => ExcType::MemoryError,
            Self::Operation { .. } | Self::Time { .. } => ExcType::TimeoutError,
            Self::Recursion { .. } => ExcType::RecursionError,
        };
        SimpleException::new(exc_type, Some(self.to_string()))
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        // RecursionError must stay catchable so `except RecursionError` works; budget
        // exhaustion must not be swallowed by user handlers.
        if matches!(err, ResourceError::Recursion { .. }) {
            Self::Exc(Box::new(err.into_simple_exception().into()))
        } else {
            Self::UncatchableExc(Box::new(err.into_simple_exception().into()))
        }
    }
}

/// Trait for tracking resource usage during a run.
///
/// Implementations can enforce limits on allocations, instruction count, time and
/// memory. The VM calls [`Self::check_time`] once per dispatched instruction, so
/// implementations should keep it cheap.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation.
    ///
    /// `get_size` returns the approximate size in bytes of the allocation and is only
    /// invoked when memory is being tracked.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when a heap object is freed.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Called before each instruction to check operation and time limits.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// The configured recursion limit.
    fn max_recursion_depth(&self) -> usize {
        DEFAULT_MAX_RECURSION_DEPTH
    }

    /// Returns the total number of allocations tracked, if this tracker records them.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Returns the current approximate memory usage in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// A resource tracker which only enforces the recursion limit.
#[derive(Debug, Clone, Copy)]
pub struct NoLimitTracker {
    max_recursion_depth: usize,
}

impl Default for NoLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl NoLimitTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }

    /// Overrides the recursion limit, everything else stays unlimited.
    #[must_use]
    pub const fn with_recursion_limit(max_recursion_depth: usize) -> Self {
        Self { max_recursion_depth }
    }
}

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn max_recursion_depth(&self) -> usize {
        self.max_recursion_depth
    }
}

/// Configuration for resource limits.
///
/// All limits are optional - set to `None` to disable a specific limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of VM operations (instructions) per run.
    pub max_operations: Option<usize>,
    /// Maximum number of heap allocations allowed.
    pub max_allocations: Option<usize>,
    /// Maximum execution time.
    pub max_duration: Option<Duration>,
    /// Maximum heap memory in bytes (approximate).
    pub max_memory: Option<usize>,
    /// Maximum recursion depth (function call stack depth).
    pub max_recursion_depth: Option<usize>,
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, limit: usize) -> Self {
        self.max_recursion_depth = Some(limit);
        self
    }
}

/// A resource tracker which enforces [`ResourceLimits`].
///
/// The clock starts when the tracker is created, so build it right before the run.
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    start: Instant,
    operation_count: usize,
    allocation_count: usize,
    current_memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start: Instant::now(),
            operation_count: 0,
            allocation_count: 0,
            current_memory: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Number of instructions dispatched so far.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operation_count
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }
        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + get_size();
            if new_memory > max {
                return Err(ResourceError::Memory {
                    limit: max,
                    used: new_memory,
                });
            }
            self.current_memory = new_memory;
        }
        self.allocation_count += 1;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        if self.limits.max_memory.is_some() {
            self.current_memory = self.current_memory.saturating_sub(get_size());
        }
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        self.operation_count += 1;
        if let Some(max) = self.limits.max_operations
            && self.operation_count > max
        {
            return Err(ResourceError::Operation {
                limit: max,
                count: self.operation_count,
            });
        }
        // reading the clock on every instruction is measurable, sample it instead
        if let Some(limit) = self.limits.max_duration
            && self.operation_count % 64 == 0
        {
            let elapsed = self.start.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn max_recursion_depth(&self) -> usize {
        self.limits.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH)
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}
