use std::sync::Arc;

use parking_lot::Mutex;

use crate::{MemoryFile, Object, OpTable, Scheduler, SegStack, VmError};

/// The memory file shared by every context of a VM. One coarse mutex
/// serializes allocation, free and relocation; it is distinct from the
/// user-visible lock objects managed by the scheduler.
pub type SharedMemory = Arc<Mutex<MemoryFile>>;

/// A context body, run once on the context's thread.
pub type ContextProc = Box<dyn FnOnce(&mut Context) -> Result<(), VmError> + Send + 'static>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

/// One execution context: its identity plus the three standard stacks,
/// all living in the shared memory file. Contexts are created through
/// [`Context::fork`] or [`crate::Vm::fork`] and run cooperatively under
/// the scheduler's run token.
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) memory: SharedMemory,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) optable: Arc<OpTable>,
    pub(crate) operands: SegStack,
    pub(crate) execution: SegStack,
    pub(crate) dictionaries: SegStack,
}

impl Context {
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn push(&mut self, object: Object) -> Result<(), VmError> {
        self.operands.push(&mut self.memory.lock(), object)
    }

    /// Pop the operand stack; the invalid sentinel signals empty.
    pub fn pop(&mut self) -> Result<Object, VmError> {
        self.operands.pop(&mut self.memory.lock())
    }

    pub fn fetch(&self, i: usize) -> Result<Object, VmError> {
        self.operands.fetch(&self.memory.lock(), i)
    }

    pub fn store(&mut self, i: usize, object: Object) -> Result<(), VmError> {
        self.operands.store(&mut self.memory.lock(), i, object)
    }

    pub fn depth(&self) -> Result<usize, VmError> {
        self.operands.depth(&self.memory.lock())
    }

    pub fn clear_operands(&mut self) -> Result<(), VmError> {
        self.operands.clear(&mut self.memory.lock())
    }

    /// Dispatch a named operator against this context's operand stack.
    pub fn invoke(&mut self, name: &str) -> Result<(), VmError> {
        let table = self.optable.clone();
        table.invoke(self, name)
    }

    /// Start a child context with `args` already on its operand stack,
    /// bottom to top. The child's stacks are built before its thread
    /// starts, so the child never observes them half-made.
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

    /// Block until `target` terminates and take its final operand stack,
    /// bottom to top. A second join on the same context, or a join on a
    /// detached one, reports `InvalidContext`.
    pub fn join(&mut self, target: ContextId) -> Result<Vec<Object>, VmError> {
        self.scheduler.join(Some(self.id), target)
    }

    pub fn detach(&mut self, target: ContextId) -> Result<(), VmError> {
        self.scheduler.detach(target)
    }

    /// Hand the run token to the next ready context.
    pub fn yield_now(&mut self) {
        self.scheduler.yield_now(self.id);
    }

    pub fn new_lock(&mut self) -> u32 {
        self.scheduler.create_lock()
    }

    pub fn new_condition(&mut self) -> u32 {
        self.scheduler.create_condition()
    }

    /// Run `body` holding `lock`. The lock is released on every exit path;
    /// a body error wins over a release error when both occur.
    pub fn monitor<F>(&mut self, lock: u32, body: F) -> Result<(), VmError>
    where
        F: FnOnce(&mut Context) -> Result<(), VmError>,
    {
        self.scheduler.acquire(self.id, lock)?;
        let result = body(self);
        let released = self.scheduler.release(self.id, lock);
        result.and(released)
    }

    /// Atomically release `lock` and sleep on `condition`; on return the
    /// lock is held again. The caller must hold the lock.
    pub fn wait(&mut self, lock: u32, condition: u32) -> Result<(), VmError> {
        self.scheduler.wait(self.id, lock, condition)
    }

    /// Wake every context waiting on `condition`. Each one reacquires its
    /// lock through the ordinary grant queue before resuming.
    pub fn notify(&mut self, condition: u32) -> Result<(), VmError> {
        self.scheduler.notify(condition)
    }

    /// Collect the final operand stack and return every segment chain to
    /// the allocator. Runs once, when the context body has returned.
    pub(crate) fn finish(
        &mut self,
        outcome: Result<(), VmError>,
    ) -> Result<Vec<Object>, VmError> {
        let mem = &mut *self.memory.lock();
        let results = match outcome {
            Ok(()) => {
                let depth = self.operands.depth(mem)?;
                let mut results = Vec::with_capacity(depth);
                for i in 0..depth {
                    results.push(self.operands.fetch_bottom(mem, i)?);
                }
                Ok(results)
            }
            Err(err) => Err(err),
        };
        self.operands.destroy(mem)?;
        self.execution.destroy(mem)?;
        self.dictionaries.destroy(mem)?;
        results
    }
}

/// Build a context's stacks, admit it to the scheduler and start its
/// thread. Shared by [`Context::fork`] and [`crate::Vm::fork`].
pub(crate) fn spawn_context(
    memory: &SharedMemory,
    scheduler: &Arc<Scheduler>,
    optable: &Arc<OpTable>,
    args: &[Object],
    body: ContextProc,
) -> Result<ContextId, VmError> {
    let (operands, execution, dictionaries) = {
        let mem = &mut *memory.lock();
        let operands = SegStack::create(mem)?;
        for &object in args {
            operands.push(mem, object)?;
        }
        (
            operands,
            SegStack::create(mem)?,
            SegStack::create(mem)?,
        )
    };
    let id = scheduler.admit();
    log::debug!("context {} forked with {} operands", id.0, args.len());
    let child = Context {
        id,
        memory: memory.clone(),
        scheduler: scheduler.clone(),
        optable: optable.clone(),
        operands,
        execution,
        dictionaries,
    };
    Scheduler::spawn(scheduler, child, body);
    Ok(id)
}
