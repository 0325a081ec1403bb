use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    Context, ContextId, MemoryCreateInfo, MemoryFile, Object, OpTable, Scheduler, SharedMemory,
    VmError, spawn_context,
};

#[derive(Debug, Clone, Default)]
pub struct VmCreateInfo {
    pub memory: MemoryCreateInfo,
}

/// A virtual machine instance: one shared memory file, one cooperative
/// scheduler and one operator table, shared by every context forked from
/// it. The embedding thread is not a context; it forks root contexts and
/// joins them from outside the run-token discipline.
pub struct Vm {
    memory: SharedMemory,
    scheduler: Arc<Scheduler>,
    optable: Arc<OpTable>,
}

impl Vm {
    #[must_use]
    pub fn new(info: &VmCreateInfo) -> Self {
        Self {
            memory: Arc::new(Mutex::new(MemoryFile::new(&info.memory))),
            scheduler: Arc::new(Scheduler::new()),
            optable: Arc::new(OpTable::core()),
        }
    }

    /// Start a root context with `args` on its operand stack, bottom to
    /// top.
    pub fn fork<F>(&self, args: &[Object], body: F) -> Result<ContextId, VmError>
    where
        F: FnOnce(&mut Context) -> Result<(), VmError> + Send + 'static,
    {
        spawn_context(
            &self.memory,
            &self.scheduler,
            &self.optable,
            args,
            Box::new(body),
        )
    }

    /// Block the embedding thread until `target` terminates and take its
    /// final operand stack, bottom to top.
    pub fn join(&self, target: ContextId) -> Result<Vec<Object>, VmError> {
        self.scheduler.join(None, target)
    }

    pub fn detach(&self, target: ContextId) -> Result<(), VmError> {
        self.scheduler.detach(target)
    }

    pub fn new_lock(&self) -> u32 {
        self.scheduler.create_lock()
    }

    pub fn new_condition(&self) -> u32 {
        self.scheduler.create_condition()
    }

    #[must_use]
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    #[must_use]
    pub fn optable(&self) -> &Arc<OpTable> {
        &self.optable
    }
}
