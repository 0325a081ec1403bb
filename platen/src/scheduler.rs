use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::{Context, ContextId, ContextProc, Object, VmError};

enum ContextStatus {
    Running,
    Terminated(Result<Vec<Object>, VmError>),
}

struct ContextRecord {
    status: ContextStatus,
    detached: bool,
    joiners: Vec<ContextId>,
}

struct LockRecord {
    owner: Option<ContextId>,
    queue: VecDeque<ContextId>,
}

struct CondWaiter {
    ctx: ContextId,
    lock: u32,
}

#[derive(Default)]
struct SchedState {
    next_context: u64,
    next_lock: u32,
    next_condition: u32,
    /// holder of the run token; None while the token is in flight
    current: Option<ContextId>,
    ready: VecDeque<ContextId>,
    contexts: HashMap<ContextId, ContextRecord>,
    locks: HashMap<u32, LockRecord>,
    conditions: HashMap<u32, Vec<CondWaiter>>,
}

/// Cooperative scheduler. Each context runs on its own OS thread, but a
/// single run token serializes them: exactly one context executes between
/// suspension points, and the token changes hands only at `yield`, `wait`,
/// blocking `join`, contended lock acquisition, and termination. All state
/// sits under one mutex with one condvar; a suspending context dispatches
/// the next ready one and sleeps until the token comes back.
///
/// Deadlocks are not detected; a cycle of waiting contexts simply stalls.
pub struct Scheduler {
    state: Mutex<SchedState>,
    turnover: Condvar,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedState::default()),
            turnover: Condvar::new(),
        }
    }

    /// Pass the run token to the next ready context, if any, and wake the
    /// threads so the new holder can notice.
    fn dispatch(&self, state: &mut SchedState) {
        state.current = state.ready.pop_front();
        self.turnover.notify_all();
    }

    fn suspend(&self, state: &mut parking_lot::MutexGuard<'_, SchedState>, me: ContextId) {
        self.dispatch(state);
        while state.current != Some(me) {
            self.turnover.wait(state);
        }
    }

    /// Register a new context and queue it for its first slice.
    pub(crate) fn admit(&self) -> ContextId {
        let mut state = self.state.lock();
        state.next_context += 1;
        let id = ContextId(state.next_context);
        state.contexts.insert(
            id,
            ContextRecord {
                status: ContextStatus::Running,
                detached: false,
                joiners: Vec::new(),
            },
        );
        state.ready.push_back(id);
        if state.current.is_none() {
            self.dispatch(&mut state);
        }
        id
    }

    /// Run a context body on its own named thread: wait for the first
    /// slice, run to completion, publish the outcome and pass the token.
    pub(crate) fn spawn(scheduler: &Arc<Self>, mut context: Context, body: ContextProc) {
        let sched = scheduler.clone();
        thread::Builder::new()
            .name(format!("context-{}", context.id.0))
            .spawn(move || {
                sched.wait_for_token(context.id);
                let outcome = body(&mut context);
                let result = context.finish(outcome);
                sched.finish(context.id, result);
            })
            .expect("context thread spawns");
    }

    fn wait_for_token(&self, me: ContextId) {
        let mut state = self.state.lock();
        while state.current != Some(me) {
            self.turnover.wait(&mut state);
        }
    }

    /// Publish a terminated context's outcome, wake its joiners and pass
    /// the token on. Detached contexts are reclaimed on the spot.
    fn finish(&self, me: ContextId, result: Result<Vec<Object>, VmError>) {
        let mut state = self.state.lock();
        let detached = state.contexts.get(&me).is_some_and(|rec| rec.detached);
        let joiners = state
            .contexts
            .get_mut(&me)
            .map(|rec| mem::take(&mut rec.joiners))
            .unwrap_or_default();
        if detached {
            state.contexts.remove(&me);
        } else if let Some(rec) = state.contexts.get_mut(&me) {
            rec.status = ContextStatus::Terminated(result);
        }
        state.ready.extend(joiners);
        log::debug!("context {} terminated (detached: {detached})", me.0);
        if state.current == Some(me) {
            self.dispatch(&mut state);
        } else {
            // external threads may be blocked in join
            self.turnover.notify_all();
        }
    }

    /// Wait for `target` to terminate and take its results. `me` is None
    /// when the caller is not a context (the embedding thread); contexts
    /// give up the run token while blocked, external callers just sleep on
    /// the condvar.
    pub(crate) fn join(
        &self,
        me: Option<ContextId>,
        target: ContextId,
    ) -> Result<Vec<Object>, VmError> {
        if me == Some(target) {
            return Err(VmError::InvalidContext);
        }
        let mut state = self.state.lock();
        loop {
            match state.contexts.get(&target) {
                None => return Err(VmError::InvalidContext),
                Some(rec) if rec.detached => return Err(VmError::InvalidContext),
                Some(rec) => {
                    if matches!(rec.status, ContextStatus::Terminated(_)) {
                        break;
                    }
                }
            }
            match me {
                Some(me) => {
                    if let Some(rec) = state.contexts.get_mut(&target) {
                        rec.joiners.push(me);
                    }
                    self.suspend(&mut state, me);
                }
                None => self.turnover.wait(&mut state),
            }
        }
        let record = state
            .contexts
            .remove(&target)
            .ok_or(VmError::InvalidContext)?;
        match record.status {
            ContextStatus::Terminated(result) => result,
            ContextStatus::Running => Err(VmError::InvalidContext),
        }
    }

    /// Mark `target` for reclamation without a join. Detaching twice, or
    /// detaching an already joined context, reports `InvalidContext`.
    pub(crate) fn detach(&self, target: ContextId) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let terminated = match state.contexts.get(&target) {
            None => return Err(VmError::InvalidContext),
            Some(rec) if rec.detached => return Err(VmError::InvalidContext),
            Some(rec) => matches!(rec.status, ContextStatus::Terminated(_)),
        };
        if terminated {
            state.contexts.remove(&target);
        } else if let Some(rec) = state.contexts.get_mut(&target) {
            rec.detached = true;
        }
        Ok(())
    }

    pub(crate) fn yield_now(&self, me: ContextId) {
        let mut state = self.state.lock();
        state.ready.push_back(me);
        self.suspend(&mut state, me);
    }

    pub(crate) fn create_lock(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_lock += 1;
        let id = state.next_lock;
        state.locks.insert(
            id,
            LockRecord {
                owner: None,
                queue: VecDeque::new(),
            },
        );
        id
    }

    pub(crate) fn create_condition(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_condition += 1;
        let id = state.next_condition;
        state.conditions.insert(id, Vec::new());
        id
    }

    /// Take `lock`, suspending behind its FIFO queue when it is held.
    /// Reacquiring a lock the caller already holds reports
    /// `InvalidContext` instead of deadlocking on itself.
    pub(crate) fn acquire(&self, me: ContextId, lock: u32) -> Result<(), VmError> {
        let mut state = self.state.lock();
        {
            let record = state.locks.get_mut(&lock).ok_or(VmError::InvalidContext)?;
            match record.owner {
                None => {
                    record.owner = Some(me);
                    return Ok(());
                }
                Some(owner) if owner == me => return Err(VmError::InvalidContext),
                Some(_) => record.queue.push_back(me),
            }
        }
        // ownership is transferred to us by the releasing context before
        // we are readied, so holding the token again means holding the lock
        self.suspend(&mut state, me);
        Ok(())
    }

    /// Drop `lock`, handing it straight to the queue front if any. The
    /// releaser keeps the run token; the new owner waits its turn.
    pub(crate) fn release(&self, me: ContextId, lock: u32) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let granted = {
            let record = state.locks.get_mut(&lock).ok_or(VmError::InvalidContext)?;
            if record.owner != Some(me) {
                return Err(VmError::LockNotHeld);
            }
            let next = record.queue.pop_front();
            record.owner = next;
            next
        };
        if let Some(next) = granted {
            state.ready.push_back(next);
        }
        Ok(())
    }

    /// Release `lock`, sleep on `condition`, and reacquire before
    /// returning. The release and the registration are one atomic step
    /// under the scheduler mutex, so a notify cannot slip between them.
    pub(crate) fn wait(&self, me: ContextId, lock: u32, condition: u32) -> Result<(), VmError> {
        let mut state = self.state.lock();
        if !state.conditions.contains_key(&condition) {
            return Err(VmError::InvalidContext);
        }
        let granted = {
            let record = state.locks.get_mut(&lock).ok_or(VmError::InvalidContext)?;
            if record.owner != Some(me) {
                return Err(VmError::LockNotHeld);
            }
            let next = record.queue.pop_front();
            record.owner = next;
            next
        };
        if let Some(next) = granted {
            state.ready.push_back(next);
        }
        if let Some(waiters) = state.conditions.get_mut(&condition) {
            waiters.push(CondWaiter { ctx: me, lock });
        }
        self.suspend(&mut state, me);
        Ok(())
    }

    /// Wake every waiter of `condition`. A waiter whose lock is free gets
    /// it and becomes ready at once; otherwise it joins the lock's grant
    /// queue and resumes when the holder releases.
    pub(crate) fn notify(&self, condition: u32) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let waiters = mem::take(
            state
                .conditions
                .get_mut(&condition)
                .ok_or(VmError::InvalidContext)?,
        );
        for waiter in waiters {
            let granted = match state.locks.get_mut(&waiter.lock) {
                Some(record) if record.owner.is_none() => {
                    record.owner = Some(waiter.ctx);
                    true
                }
                Some(record) => {
                    record.queue.push_back(waiter.ctx);
                    false
                }
                None => {
                    log::warn!("waiter of condition {condition} names unknown lock");
                    continue;
                }
            };
            if granted {
                state.ready.push_back(waiter.ctx);
            }
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Vm, VmCreateInfo};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log_entry(log: &Log, entry: &'static str) {
        log.lock().push(entry);
    }

    #[test]
    fn fork_runs_the_body_over_the_initial_operands() {
        let vm = Vm::new(&VmCreateInfo::default());
        let id = vm
            .fork(
                &[Object::mark(), Object::integer(1), Object::integer(2)],
                |ctx| ctx.invoke("add"),
            )
            .unwrap();
        let results = vm.join(id).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Object::mark());
        assert_eq!(results[1].as_integer(), Some(3));
    }

    #[test]
    fn join_after_detach_is_invalidcontext() {
        let vm = Vm::new(&VmCreateInfo::default());
        let id = vm.fork(&[], |ctx| ctx.push(Object::integer(1))).unwrap();
        vm.detach(id).unwrap();
        assert_eq!(vm.join(id), Err(VmError::InvalidContext));
    }

    #[test]
    fn second_join_is_invalidcontext() {
        let vm = Vm::new(&VmCreateInfo::default());
        let id = vm.fork(&[], |_| Ok(())).unwrap();
        assert!(vm.join(id).is_ok());
        assert_eq!(vm.join(id), Err(VmError::InvalidContext));
    }

    #[test]
    fn join_on_an_unknown_context_is_invalidcontext() {
        let vm = Vm::new(&VmCreateInfo::default());
        assert_eq!(vm.join(ContextId(999)), Err(VmError::InvalidContext));
    }

    #[test]
    fn body_error_surfaces_through_join() {
        let vm = Vm::new(&VmCreateInfo::default());
        let id = vm.fork(&[], |ctx| ctx.invoke("frobnicate")).unwrap();
        assert_eq!(vm.join(id), Err(VmError::Undefined));
    }

    #[test]
    fn context_can_join_its_own_child() {
        let vm = Vm::new(&VmCreateInfo::default());
        let id = vm
            .fork(&[], |ctx| {
                let child = ctx.fork(&[Object::integer(20), Object::integer(22)], |child| {
                    child.invoke("add")
                })?;
                for object in ctx.join(child)? {
                    ctx.push(object)?;
                }
                Ok(())
            })
            .unwrap();
        let results = vm.join(id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_integer(), Some(42));
    }

    #[test]
    fn yielding_contexts_interleave_in_fork_order() {
        let vm = Vm::new(&VmCreateInfo::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let log_a = log.clone();
        let a = vm
            .fork(&[], move |ctx| {
                log_entry(&log_a, "a1");
                ctx.yield_now();
                log_entry(&log_a, "a2");
                Ok(())
            })
            .unwrap();
        let log_b = log.clone();
        let b = vm
            .fork(&[], move |ctx| {
                log_entry(&log_b, "b1");
                ctx.yield_now();
                log_entry(&log_b, "b2");
                Ok(())
            })
            .unwrap();

        vm.join(a).unwrap();
        vm.join(b).unwrap();
        assert_eq!(*log.lock(), ["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn monitor_wait_notify_round_trip() {
        let vm = Vm::new(&VmCreateInfo::default());
        let lock = vm.new_lock();
        let condition = vm.new_condition();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let log_x = log.clone();
        let x = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| {
                    log_entry(&log_x, "x-wait");
                    ctx.wait(lock, condition)?;
                    log_entry(&log_x, "x-resume");
                    Ok(())
                })
            })
            .unwrap();
        let log_y = log.clone();
        let y = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| {
                    log_entry(&log_y, "y-notify");
                    ctx.notify(condition)
                })
            })
            .unwrap();
        let log_z = log.clone();
        let z = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| {
                    log_entry(&log_z, "z-enter");
                    Ok(())
                })
            })
            .unwrap();

        vm.join(x).unwrap();
        vm.join(y).unwrap();
        vm.join(z).unwrap();

        let events = log.lock().clone();
        assert_eq!(events[0], "x-wait", "first context enters the monitor first");
        let resume = events.iter().position(|e| *e == "x-resume");
        let enter = events.iter().position(|e| *e == "z-enter");
        assert!(
            resume < enter,
            "the woken waiter reacquires before later arrivals: {events:?}"
        );
    }

    #[test]
    fn monitor_releases_the_lock_on_body_error() {
        let vm = Vm::new(&VmCreateInfo::default());
        let lock = vm.new_lock();
        let a = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| ctx.invoke("frobnicate"))
            })
            .unwrap();
        assert_eq!(vm.join(a), Err(VmError::Undefined));

        // the lock must be free again for the next context
        let b = vm.fork(&[], move |ctx| ctx.monitor(lock, |_| Ok(()))).unwrap();
        assert!(vm.join(b).is_ok());
    }

    #[test]
    fn wait_without_holding_the_lock_is_refused() {
        let vm = Vm::new(&VmCreateInfo::default());
        let lock = vm.new_lock();
        let condition = vm.new_condition();
        let id = vm
            .fork(&[], move |ctx| ctx.wait(lock, condition))
            .unwrap();
        assert_eq!(vm.join(id), Err(VmError::LockNotHeld));
    }

    #[test]
    fn reentrant_monitor_is_refused() {
        let vm = Vm::new(&VmCreateInfo::default());
        let lock = vm.new_lock();
        let id = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| ctx.monitor(lock, |_| Ok(())))
            })
            .unwrap();
        assert_eq!(vm.join(id), Err(VmError::InvalidContext));
    }

    #[test]
    fn notify_wakes_every_waiter() {
        let vm = Vm::new(&VmCreateInfo::default());
        let lock = vm.new_lock();
        let condition = vm.new_condition();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for name in ["w1-resume", "w2-resume"] {
            let log_w = log.clone();
            let id = vm
                .fork(&[], move |ctx| {
                    ctx.monitor(lock, |ctx| {
                        ctx.wait(lock, condition)?;
                        log_entry(&log_w, name);
                        Ok(())
                    })
                })
                .unwrap();
            waiters.push(id);
        }
        let notifier = vm
            .fork(&[], move |ctx| {
                ctx.monitor(lock, |ctx| ctx.notify(condition))
            })
            .unwrap();

        vm.join(notifier).unwrap();
        for id in waiters {
            vm.join(id).unwrap();
        }
        let mut events = log.lock().clone();
        events.sort_unstable();
        assert_eq!(events, ["w1-resume", "w2-resume"]);
    }
}
