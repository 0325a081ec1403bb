use std::collections::HashMap;

use crate::{Context, ContextId, MemoryFile, Object, SegStack, Tag, VmError};

/// Declared type pattern for one operand slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandType {
    Any,
    Of(Tag),
}

impl OperandType {
    fn matches(self, object: Object) -> bool {
        match self {
            OperandType::Any => true,
            OperandType::Of(tag) => object.tag() == tag,
        }
    }
}

/// A registered operator: name, operand pattern (bottom to top) and body.
/// The dispatcher pops the operands and hands them to the body in the same
/// bottom-to-top order.
pub struct Operator {
    pub name: &'static str,
    pub operands: &'static [OperandType],
    pub body: fn(&mut Context, &[Object]) -> Result<(), VmError>,
}

/// Name-indexed operator registry shared by every context of a VM.
pub struct OpTable {
    index: HashMap<&'static str, u32>,
    operators: Vec<Operator>,
}

impl OpTable {
    /// The core set: stack shuffling, `add` for end-to-end arithmetic, and
    /// the concurrency operators that take their operands off the stack.
    #[must_use]
    pub fn core() -> Self {
        let mut table = Self {
            index: HashMap::new(),
            operators: Vec::new(),
        };
        use OperandType::{Any, Of};
        table.install("pop", &[Any], apply_pop);
        table.install("exch", &[Any, Any], apply_exch);
        table.install("dup", &[Any], apply_dup);
        table.install("copy", &[Of(Tag::Integer)], apply_copy);
        table.install("index", &[Of(Tag::Integer)], apply_index);
        table.install("roll", &[Of(Tag::Integer), Of(Tag::Integer)], apply_roll);
        table.install("clear", &[], apply_clear);
        table.install("count", &[], apply_count);
        table.install("add", &[Of(Tag::Integer), Of(Tag::Integer)], apply_add);
        table.install("currentcontext", &[], apply_currentcontext);
        table.install("yield", &[], apply_yield);
        table.install("lock", &[], apply_lock);
        table.install("condition", &[], apply_condition);
        table.install("detach", &[Of(Tag::Context)], apply_detach);
        table.install("join", &[Of(Tag::Context)], apply_join);
        table.install("wait", &[Of(Tag::Lock), Of(Tag::Condition)], apply_wait);
        table.install("notify", &[Of(Tag::Condition)], apply_notify);
        table
    }

    pub fn install(
        &mut self,
        name: &'static str,
        operands: &'static [OperandType],
        body: fn(&mut Context, &[Object]) -> Result<(), VmError>,
    ) -> u32 {
        let index = self.operators.len() as u32;
        self.operators.push(Operator {
            name,
            operands,
            body,
        });
        self.index.insert(name, index);
        index
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn invoke(&self, ctx: &mut Context, name: &str) -> Result<(), VmError> {
        let index = self.lookup(name).ok_or(VmError::Undefined)?;
        self.invoke_index(ctx, index)
    }

    /// Dispatch by table index: check depth, check every operand's type in
    /// place, and only then pop. A failed check leaves the stack untouched.
    pub fn invoke_index(&self, ctx: &mut Context, index: u32) -> Result<(), VmError> {
        let op = self
            .operators
            .get(index as usize)
            .ok_or(VmError::Undefined)?;
        let arity = op.operands.len();
        let operands = ctx.operands;
        let mut args = Vec::with_capacity(arity);
        {
            let mem = &mut *ctx.memory.lock();
            if operands.depth(mem)? < arity {
                return Err(VmError::StackUnderflow);
            }
            for (i, pattern) in op.operands.iter().enumerate() {
                let object = operands.fetch(mem, arity - 1 - i)?;
                if !pattern.matches(object) {
                    return Err(VmError::TypeCheck);
                }
                args.push(object);
            }
            for _ in 0..arity {
                operands.pop(mem)?;
            }
        }
        log::trace!("invoke {}", op.name);
        (op.body)(ctx, &args)
    }
}

fn integer_arg(args: &[Object], i: usize) -> Result<i64, VmError> {
    args.get(i)
        .and_then(Object::as_integer)
        .ok_or(VmError::TypeCheck)
}

fn apply_pop(_ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    Ok(())
}

fn apply_exch(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    ctx.push(args[1])?;
    ctx.push(args[0])
}

fn apply_dup(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    ctx.push(args[0])?;
    ctx.push(args[0])
}

/// Push copies of the top `n` elements, preserving their order.
fn op_copy(stack: SegStack, mem: &mut MemoryFile, n: i64) -> Result<(), VmError> {
    if n < 0 {
        return Err(VmError::RangeCheck);
    }
    let n = n as usize;
    let mut window = Vec::with_capacity(n);
    for i in 0..n {
        window.push(stack.fetch(mem, n - 1 - i)?);
    }
    for object in window {
        stack.push(mem, object)?;
    }
    Ok(())
}

fn apply_copy(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let n = integer_arg(args, 0)?;
    let operands = ctx.operands;
    op_copy(operands, &mut ctx.memory.lock(), n)
}

fn op_index(stack: SegStack, mem: &mut MemoryFile, n: i64) -> Result<(), VmError> {
    if n < 0 {
        return Err(VmError::RangeCheck);
    }
    let object = stack.fetch(mem, n as usize)?;
    stack.push(mem, object)
}

fn apply_index(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let n = integer_arg(args, 0)?;
    let operands = ctx.operands;
    op_index(operands, &mut ctx.memory.lock(), n)
}

/// Rotate the top `n` elements by `j` places toward the top. Any `j` is
/// reduced modulo `n`, so negative shifts rotate the other way. The window
/// is read in full before the first write, so a failure mutates nothing.
fn op_roll(stack: SegStack, mem: &mut MemoryFile, n: i64, j: i64) -> Result<(), VmError> {
    if n < 0 {
        return Err(VmError::RangeCheck);
    }
    if n == 0 {
        return Ok(());
    }
    let count = n as usize;
    let mut window = Vec::with_capacity(count);
    for i in 0..count {
        window.push(stack.fetch(mem, count - 1 - i)?);
    }
    let shift = j.rem_euclid(n) as usize;
    if shift == 0 {
        return Ok(());
    }
    window.rotate_left(shift);
    for (i, object) in window.into_iter().enumerate() {
        stack.store(mem, count - 1 - i, object)?;
    }
    Ok(())
}

fn apply_roll(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let n = integer_arg(args, 0)?;
    let j = integer_arg(args, 1)?;
    let operands = ctx.operands;
    op_roll(operands, &mut ctx.memory.lock(), n, j)
}

fn apply_clear(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    let operands = ctx.operands;
    operands.clear(&mut ctx.memory.lock())
}

fn apply_count(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    let operands = ctx.operands;
    let mem = &mut *ctx.memory.lock();
    let depth = operands.depth(mem)?;
    operands.push(mem, Object::integer(depth as i64))
}

fn apply_add(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let a = integer_arg(args, 0)?;
    let b = integer_arg(args, 1)?;
    let sum = a.checked_add(b).ok_or(VmError::RangeCheck)?;
    ctx.push(Object::integer(sum))
}

fn apply_currentcontext(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    let ident = ctx.id().0;
    ctx.push(Object::context(ident))
}

fn apply_yield(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    ctx.yield_now();
    Ok(())
}

fn apply_lock(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    let ident = ctx.new_lock();
    ctx.push(Object::lock(ident))
}

fn apply_condition(ctx: &mut Context, _args: &[Object]) -> Result<(), VmError> {
    let ident = ctx.new_condition();
    ctx.push(Object::condition(ident))
}

fn apply_detach(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let ident = args[0].context_ident().ok_or(VmError::TypeCheck)?;
    ctx.detach(ContextId(ident))
}

fn apply_join(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let ident = args[0].context_ident().ok_or(VmError::TypeCheck)?;
    let results = ctx.join(ContextId(ident))?;
    for object in results {
        ctx.push(object)?;
    }
    Ok(())
}

fn apply_wait(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let lock = args[0].lock_ident().ok_or(VmError::TypeCheck)?;
    let condition = args[1].condition_ident().ok_or(VmError::TypeCheck)?;
    ctx.wait(lock, condition)
}

fn apply_notify(ctx: &mut Context, args: &[Object]) -> Result<(), VmError> {
    let condition = args[0].condition_ident().ok_or(VmError::TypeCheck)?;
    ctx.notify(condition)
}
