//! The opcode dispatch loop and its call/branch machinery.
//!
//! Execution is cooperative: [`Module::tick`] runs opcodes until the
//! top-level function returns, a trap occurs, or the per-tick gas budget is
//! spent. Gas is decremented on control-flow opcodes only; a straight-line
//! run of arithmetic executes until the next control opcode. The host loops
//! on [`TickOutcome::NeedMoreGas`] to resume, with no argument changes.

use crate::func::FuncBody;
use crate::instance::{BlockEntry, BlockKind, Instance, SP_INITIAL};
use crate::isa;
use crate::leb::ByteReader;
use crate::module::Module;
use crate::types::ValueType;
use crate::value::{ArithmeticOps, Float, Integer, TryTruncateInto, ValueCell};
use crate::{Trap, TrapCode};

/// Result of a completed `tick` that did not trap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The top-level function returned; results are on the operand stack.
    Done,
    /// The gas budget ran out mid-execution. Call `tick` again to resume.
    NeedMoreGas,
}

fn trap_code(d: &mut Instance, code: TrapCode) -> Trap {
    let msg = code.to_string();
    d.trap(code, &msg)
}

/// Scan forward from `pos` for the `end` closing the block entered just
/// before `pos`, skipping nested blocks by depth counting.
fn find_br_addr(bytes: &[u8], pos: usize) -> usize {
    let mut pos = pos;
    let mut depth = 1u32;
    while pos < bytes.len() {
        match bytes[pos] {
            isa::BLOCK | isa::LOOP | isa::IF => depth += 1,
            isa::END => {
                depth -= 1;
                if depth == 0 {
                    return pos;
                }
            }
            _ => {}
        }
        pos += isa::op_len(bytes, pos);
    }
    pos
}

/// Like [`find_br_addr`] but also stops at an `else` on the entry's own
/// nesting level.
fn find_else_or_end(bytes: &[u8], pos: usize) -> usize {
    let mut pos = pos;
    let mut depth = 1u32;
    while pos < bytes.len() {
        match bytes[pos] {
            isa::BLOCK | isa::LOOP | isa::IF => depth += 1,
            isa::ELSE => {
                if depth == 1 {
                    return pos;
                }
            }
            isa::END => {
                depth -= 1;
                if depth == 0 {
                    return pos;
                }
            }
            _ => {}
        }
        pos += isa::op_len(bytes, pos);
    }
    pos
}

// Typed stack helpers. The cell is untagged; the bytecode tells us which
// view to take.

fn binop<T, F>(d: &mut Instance, f: F)
where
    T: From<ValueCell>,
    ValueCell: From<T>,
    F: FnOnce(T, T) -> T,
{
    let b = T::from(d.pop());
    let a = T::from(d.top());
    d.set_top(ValueCell::from(f(a, b)));
}

fn try_binop<T, F>(d: &mut Instance, f: F) -> Result<(), Trap>
where
    T: From<ValueCell>,
    ValueCell: From<T>,
    F: FnOnce(T, T) -> Result<T, TrapCode>,
{
    let b = T::from(d.pop());
    let a = T::from(d.top());
    match f(a, b) {
        Ok(v) => {
            d.set_top(ValueCell::from(v));
            Ok(())
        }
        Err(code) => Err(trap_code(d, code)),
    }
}

fn cmp<T, F>(d: &mut Instance, f: F)
where
    T: From<ValueCell>,
    F: FnOnce(T, T) -> bool,
{
    let b = T::from(d.pop());
    let a = T::from(d.top());
    d.set_top(ValueCell::from(f(a, b)));
}

fn unop<T, F>(d: &mut Instance, f: F)
where
    T: From<ValueCell>,
    ValueCell: From<T>,
    F: FnOnce(T) -> T,
{
    let a = T::from(d.top());
    d.set_top(ValueCell::from(f(a)));
}

fn cvt<T, U, F>(d: &mut Instance, f: F)
where
    T: From<ValueCell>,
    ValueCell: From<U>,
    F: FnOnce(T) -> U,
{
    let a = T::from(d.top());
    d.set_top(ValueCell::from(f(a)));
}

fn try_cvt<T, U, F>(d: &mut Instance, f: F) -> Result<(), Trap>
where
    T: From<ValueCell>,
    ValueCell: From<U>,
    F: FnOnce(T) -> Result<U, TrapCode>,
{
    let a = T::from(d.top());
    match f(a) {
        Ok(v) => {
            d.set_top(ValueCell::from(v));
            Ok(())
        }
        Err(code) => Err(trap_code(d, code)),
    }
}

fn load<const N: usize>(d: &mut Instance, addr: u32) -> Result<[u8; N], Trap> {
    match d.memory.load_bytes::<N>(addr) {
        Some(bytes) => Ok(bytes),
        None => Err(d.trap(
            TrapCode::MemoryOutOfRange,
            &format!("mem out of range {:#x} {:#x}", addr, N),
        )),
    }
}

fn store(d: &mut Instance, addr: u32, bytes: &[u8]) -> Result<(), Trap> {
    match d.memory.store_bytes(addr, bytes) {
        Some(()) => Ok(()),
        None => Err(d.trap(
            TrapCode::MemoryOutOfRange,
            &format!("mem out of range {:#x} {:#x}", addr, bytes.len()),
        )),
    }
}

/// Alignment hint (ignored) and offset of a load/store.
fn read_memarg(r: &mut ByteReader) -> u32 {
    let _align = r.read_var_u32();
    r.read_var_u32()
}

impl Module {
    /// Push a frame for internal function `func_index`: parameters stay in
    /// place below the new frame pointer, local slots are reserved
    /// (uninitialised), and the program counter moves to the body.
    pub fn setup_call(&self, d: &mut Instance, func_index: u32) -> Result<(), Trap> {
        let imported = self.funcs.imported_count();
        if func_index < imported {
            return Err(trap_code(d, TrapCode::CannotCallImportedHere));
        }
        let func = match self.funcs.get(func_index) {
            Some(f) => f,
            None => return Err(trap_code(d, TrapCode::FuncIndexOutOfRange)),
        };
        let ty = self
            .func_type_by_index(i64::from(func.type_index))
            .ok_or(TrapCode::UnknownBlockType)
            .map_err(|c| trap_code(d, c))?;
        let params = ty.params().len() as u16;
        if u32::from(d.sp.wrapping_add(1)) < u32::from(params) {
            return Err(d.trap(
                TrapCode::InsufficientParameters,
                &format!("insufficient parameters calling {}", func_index),
            ));
        }
        let (start, locals) = match func.body {
            FuncBody::Internal { start, locals, .. } => (start, locals),
            FuncBody::Imported { .. } => {
                return Err(trap_code(d, TrapCode::CannotCallImportedHere))
            }
        };

        let expected_sp_after_call = d.sp.wrapping_sub(params);
        d.blocks.push(BlockEntry {
            type_index: i64::from(func.type_index),
            kind: BlockKind::Func {
                func_index,
                frame_pointer: d.fp,
                return_addr: d.pc,
            },
            stack_pointer: expected_sp_after_call,
        });

        // The callee addresses parameters and locals relative to the frame
        // pointer; +1 compensates for the stack pointer starting at -1.
        d.fp = expected_sp_after_call.wrapping_add(1);
        d.sp = d.sp.wrapping_add(locals as u16);
        d.pc = start;
        Ok(())
    }

    fn call_imported(&self, d: &mut Instance, func_index: u32) -> Result<(), Trap> {
        let (host, type_index) = match self.funcs.get(func_index) {
            Some(func) => match &func.body {
                FuncBody::Imported { host } => (host.clone(), func.type_index),
                FuncBody::Internal { .. } => {
                    return Err(trap_code(d, TrapCode::FuncIndexOutOfRange))
                }
            },
            None => return Err(trap_code(d, TrapCode::FuncIndexOutOfRange)),
        };
        let ty = self
            .func_type_by_index(i64::from(type_index))
            .ok_or(TrapCode::UnknownBlockType)
            .map_err(|c| trap_code(d, c))?;
        let params = ty.params().len() as u16;
        let results = ty.results().len() as u16;
        if u32::from(d.sp.wrapping_add(1)) < u32::from(params) {
            return Err(d.trap(
                TrapCode::InsufficientParameters,
                &format!("insufficient parameters calling {}", func_index),
            ));
        }

        let expected_sp_after_call = d.sp.wrapping_sub(params);
        let saved_fp = d.fp;
        d.fp = expected_sp_after_call.wrapping_add(1);

        host(d);

        if d.has_exception() {
            return Err(Trap::new(TrapCode::HostFunctionError));
        }
        if d.sp != expected_sp_after_call.wrapping_add(results) {
            return Err(d.trap(
                TrapCode::HostStackMismatch,
                &format!(
                    "unexpected stack after host call of {}: {} != {} + {}",
                    func_index, d.sp, expected_sp_after_call, results
                ),
            ));
        }
        d.fp = saved_fp;
        Ok(())
    }

    /// Set up a call to exported function `func_index` (arguments must be on
    /// the stack already) and run the first tick.
    pub fn call_exported(&self, d: &mut Instance, func_index: u32) -> Result<TickOutcome, Trap> {
        self.setup_call(d, func_index)?;
        self.tick(d)
    }

    /// Run opcodes until the outermost frame returns, the gas budget is
    /// spent, or a trap occurs. Resumable after `NeedMoreGas` with no
    /// argument changes.
    pub fn tick(&self, d: &mut Instance) -> Result<TickOutcome, Trap> {
        let code: &[u8] = &self.bytecode;

        if d.blocks.is_empty() {
            return Ok(TickOutcome::Done);
        }
        if !d.sentinel_intact() {
            return Err(Trap::new(TrapCode::StackOverflow));
        }
        if d.pc >= code.len() {
            return Err(Trap::new(TrapCode::PcOutOfRange));
        }
        if d.has_exception() {
            return Err(Trap::new(TrapCode::PendingException));
        }

        d.refill_gas();

        // Checks shared by every control-flow opcode: the stack sentinel,
        // the program counter, then gas. Gas goes last so that a suspended
        // instance resumes exactly where it left off.
        macro_rules! control_checks {
            () => {
                if !d.sentinel_intact() {
                    return Err(Trap::new(TrapCode::StackOverflow));
                }
                if d.pc >= code.len() {
                    return Err(trap_code(d, TrapCode::PcOutOfRange));
                }
                d.gas -= 1;
                if d.gas <= 0 {
                    return Ok(TickOutcome::NeedMoreGas);
                }
            };
        }

        loop {
            let mut r = ByteReader::at(code, d.pc);
            let opcode = r.read_u8();
            tracing::trace!(pc = d.pc, opcode, "dispatch");
            match opcode {
                isa::UNREACHABLE => {
                    return Err(d.trap(TrapCode::UnreachableExecuted, "unreachable"));
                }
                isa::NOP => {
                    d.pc = r.pos;
                    d.gas -= 1;
                    if d.gas <= 0 {
                        return Ok(TickOutcome::NeedMoreGas);
                    }
                    continue;
                }
                isa::BLOCK => {
                    let block_type = r.read_var_s(33);
                    if self.func_type_by_index(block_type).is_none() {
                        return Err(trap_code(d, TrapCode::UnknownBlockType));
                    }
                    let branch_addr = find_br_addr(code, r.pos);
                    if branch_addr > code.len() {
                        return Err(trap_code(d, TrapCode::BranchOutOfRange));
                    }
                    d.blocks.push(BlockEntry {
                        type_index: block_type,
                        kind: BlockKind::Block { branch_addr },
                        stack_pointer: d.sp,
                    });
                    d.pc = r.pos;
                    control_checks!();
                    continue;
                }
                isa::LOOP => {
                    let block_type = r.read_var_s(33);
                    if self.func_type_by_index(block_type).is_none() {
                        return Err(trap_code(d, TrapCode::UnknownBlockType));
                    }
                    // A branch to a loop re-enters it: the target is the
                    // first byte after the loop opcode.
                    d.blocks.push(BlockEntry {
                        type_index: block_type,
                        kind: BlockKind::Loop { branch_addr: r.pos },
                        stack_pointer: d.sp,
                    });
                    d.pc = r.pos;
                    control_checks!();
                    continue;
                }
                isa::IF => {
                    let block_type = r.read_var_s(33);
                    if self.func_type_by_index(block_type).is_none() {
                        return Err(trap_code(d, TrapCode::UnknownBlockType));
                    }
                    // Resolve both arms up front; the else arm is rare in
                    // compiled output but cheap to find in the same scan.
                    let addr = find_else_or_end(code, r.pos);
                    if addr >= code.len() {
                        return Err(trap_code(d, TrapCode::BranchOutOfRange));
                    }
                    let (else_addr, end_addr) = match code[addr] {
                        isa::END => (0, addr),
                        isa::ELSE => {
                            let end_addr = find_else_or_end(code, addr + 1);
                            if end_addr >= code.len() || code[end_addr] != isa::END {
                                return Err(d.trap(TrapCode::MissingEnd, "no end in sight"));
                            }
                            (addr, end_addr)
                        }
                        _ => return Err(d.trap(TrapCode::MissingEnd, "no end or else found")),
                    };
                    // The condition is consumed before the block is
                    // entered; the saved stack pointer must not cover it.
                    let cond = u32::from(d.pop());
                    d.blocks.push(BlockEntry {
                        type_index: block_type,
                        kind: BlockKind::If { else_addr, end_addr },
                        stack_pointer: d.sp,
                    });
                    d.pc = r.pos;
                    if cond == 0 {
                        if else_addr == 0 {
                            d.blocks.pop();
                            d.pc = end_addr + 1;
                        } else {
                            d.pc = else_addr + 1;
                        }
                    }
                    control_checks!();
                    continue;
                }
                isa::ELSE => {
                    // Falling into an else means the then-arm finished;
                    // skip to the end of the construct.
                    let end_addr = match d.blocks.last() {
                        Some(BlockEntry {
                            kind: BlockKind::If { end_addr, .. },
                            ..
                        }) => *end_addr,
                        _ => return Err(trap_code(d, TrapCode::ElseWithoutIf)),
                    };
                    d.pc = end_addr;
                    control_checks!();
                    continue;
                }
                isa::END => {
                    let block = match d.blocks.pop() {
                        Some(block) => block,
                        None => {
                            return Err(d.trap(TrapCode::BlockStackUnderflow, "callstack underflow"))
                        }
                    };
                    let ty = match self.func_type_by_index(block.type_index) {
                        Some(ty) => ty,
                        None => {
                            return Err(d.trap(
                                TrapCode::UnknownBlockType,
                                &format!("no type info {}", block.type_index),
                            ))
                        }
                    };
                    // Keep the block's results on top, drop locals and
                    // leftovers in between, land the stack pointer where the
                    // block found it plus the results.
                    let results = ty.results().len() as u16;
                    let available = d.sp.wrapping_sub(block.stack_pointer) as i16;
                    if available < results as i16 {
                        return Err(d.trap(TrapCode::MissingResults, "missing return values"));
                    }
                    for n in 0..results {
                        let to = block.stack_pointer.wrapping_add(results - n);
                        let from = d.sp.wrapping_sub(n);
                        d.stack[to as usize] = d.stack[from as usize];
                    }
                    d.sp = block.stack_pointer.wrapping_add(results);

                    match block.kind {
                        BlockKind::Func {
                            frame_pointer,
                            return_addr,
                            ..
                        } => {
                            d.fp = frame_pointer;
                            d.pc = return_addr;
                            if d.blocks.is_empty() {
                                return Ok(TickOutcome::Done);
                            }
                        }
                        BlockKind::InitExpr => {
                            d.pc = r.pos;
                            return Ok(TickOutcome::Done);
                        }
                        _ => {
                            d.pc = r.pos;
                        }
                    }
                    control_checks!();
                    continue;
                }
                isa::BR => {
                    let label = r.read_var_u32();
                    d.pc = r.pos;
                    branch(d, code, label)?;
                    control_checks!();
                    continue;
                }
                isa::BR_IF => {
                    let label = r.read_var_u32();
                    let cond = u32::from(d.pop());
                    d.pc = r.pos;
                    if label as usize >= d.blocks.len() {
                        return Err(d.trap(TrapCode::LabelOutOfRange, "branch stack under run"));
                    }
                    if cond != 0 {
                        branch(d, code, label)?;
                    }
                    control_checks!();
                    continue;
                }
                isa::BR_TABLE => {
                    let max_entries = 16 + code.len() / 16;
                    let count = r.read_var_u32();
                    if count as usize > max_entries {
                        return Err(trap_code(d, TrapCode::TooManyEntries));
                    }
                    let mut labels = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        labels.push(r.read_var_u32());
                    }
                    let default_label = r.read_var_u32();
                    let index = i32::from(d.pop());
                    // Out of range, in either direction, selects the
                    // default label.
                    let label = if index >= 0 && (index as u32) < count {
                        labels[index as usize]
                    } else {
                        default_label
                    };
                    d.pc = r.pos;
                    branch(d, code, label)?;
                    control_checks!();
                    continue;
                }
                isa::RETURN => {
                    // Drop every block nested in the current function
                    // without executing their ends, then resume as if at
                    // the function's own end.
                    while let Some(top) = d.blocks.last() {
                        if matches!(top.kind, BlockKind::Func { .. }) {
                            break;
                        }
                        d.blocks.pop();
                    }
                    let func_index = match d.blocks.last() {
                        Some(BlockEntry {
                            kind: BlockKind::Func { func_index, .. },
                            ..
                        }) => *func_index,
                        Some(_) => return Err(trap_code(d, TrapCode::UnexpectedReturn)),
                        None => return Err(trap_code(d, TrapCode::BlockStackUnderflow)),
                    };
                    let end = match self.funcs.get(func_index).map(|f| &f.body) {
                        Some(FuncBody::Internal { end, .. }) => *end,
                        _ => return Err(trap_code(d, TrapCode::FuncIndexOutOfRange)),
                    };
                    d.pc = end;
                    control_checks!();
                    continue;
                }
                isa::CALL => {
                    let func_index = r.read_var_u32();
                    d.pc = r.pos;
                    if func_index < self.funcs.imported_count() {
                        self.call_imported(d, func_index)?;
                    } else {
                        self.setup_call(d, func_index)?;
                    }
                    control_checks!();
                    continue;
                }
                isa::CALL_INDIRECT => {
                    let type_index = r.read_var_u32();
                    let table_index = r.read_var_u32();
                    d.pc = r.pos;
                    if table_index != 0 {
                        return Err(trap_code(d, TrapCode::OnlyOneTableAllowed));
                    }
                    let slot = u32::from(d.pop());
                    let func_index = match self.table.get(slot as usize) {
                        Some(&idx) => idx,
                        None => {
                            return Err(d.trap(
                                TrapCode::TableIndexOutOfRange,
                                &format!("table slot {} out of range", slot),
                            ))
                        }
                    } as u32;
                    let func = match self.funcs.get(func_index) {
                        Some(f) => f,
                        None => {
                            return Err(d.trap(
                                TrapCode::FuncIndexOutOfRange,
                                &format!("{} {}", func_index, self.funcs.len()),
                            ))
                        }
                    };
                    if func.type_index != type_index {
                        return Err(d.trap(
                            TrapCode::IndirectCallTypeMismatch,
                            &format!("{} != {}", func.type_index, type_index),
                        ));
                    }
                    let ty = self
                        .func_type_by_index(i64::from(func.type_index))
                        .ok_or(TrapCode::UnknownBlockType)
                        .map_err(|c| trap_code(d, c))?;
                    let params = ty.params().len() as u16;
                    let available = d.sp.wrapping_add(1).wrapping_sub(d.fp);
                    if params > available {
                        return Err(d.trap(
                            TrapCode::IndirectCallInsufficientParams,
                            &format!("{} > {}", params, available),
                        ));
                    }
                    if func_index < self.funcs.imported_count() {
                        self.call_imported(d, func_index)?;
                    } else {
                        self.setup_call(d, func_index)?;
                    }
                    control_checks!();
                    continue;
                }

                isa::DROP => {
                    d.pop();
                }
                isa::SELECT => {
                    let cond = u32::from(d.pop());
                    let b = d.pop();
                    if cond == 0 {
                        d.set_top(b);
                    }
                }
                isa::SELECT_T => {
                    return Err(trap_code(d, TrapCode::ParametricNotSupported));
                }

                isa::LOCAL_GET => {
                    let local = r.read_var_u32();
                    d.push(d.local(local));
                }
                isa::LOCAL_SET => {
                    let local = r.read_var_u32();
                    let v = d.pop();
                    d.set_local(local, v);
                }
                isa::LOCAL_TEE => {
                    let local = r.read_var_u32();
                    d.set_local(local, d.top());
                }
                isa::GLOBAL_GET => {
                    let global = r.read_var_u32();
                    match d.global(global) {
                        Some(v) => d.push(ValueCell(v)),
                        None => return Err(trap_code(d, TrapCode::GlobalIndexOutOfRange)),
                    }
                }
                isa::GLOBAL_SET => {
                    let global = r.read_var_u32();
                    if global as usize >= d.globals.len() {
                        return Err(trap_code(d, TrapCode::GlobalIndexOutOfRange));
                    }
                    let v = d.pop();
                    d.globals[global as usize] = v.0;
                }
                isa::TABLE_GET | isa::TABLE_SET => {
                    // The function table is part of the immutable module, so
                    // table mutation stays rejected.
                    return Err(trap_code(d, TrapCode::TableInstructionsNotSupported));
                }

                isa::I32_LOAD => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i32::from_le_bytes(load::<4>(d, addr)?);
                    d.push(v.into());
                }
                isa::I64_LOAD => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i64::from_le_bytes(load::<8>(d, addr)?);
                    d.push(v.into());
                }
                isa::F32_LOAD => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u32::from_le_bytes(load::<4>(d, addr)?);
                    d.push(v.into());
                }
                isa::F64_LOAD => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u64::from_le_bytes(load::<8>(d, addr)?);
                    d.push(v.into());
                }
                isa::I32_LOAD8_S => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i8::from_le_bytes(load::<1>(d, addr)?) as i32;
                    d.push(v.into());
                }
                isa::I32_LOAD8_U => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u32::from(load::<1>(d, addr)?[0]);
                    d.push(v.into());
                }
                isa::I32_LOAD16_S => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i16::from_le_bytes(load::<2>(d, addr)?) as i32;
                    d.push(v.into());
                }
                isa::I32_LOAD16_U => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u32::from(u16::from_le_bytes(load::<2>(d, addr)?));
                    d.push(v.into());
                }
                isa::I64_LOAD8_S => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i8::from_le_bytes(load::<1>(d, addr)?) as i64;
                    d.push(v.into());
                }
                isa::I64_LOAD8_U => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u64::from(load::<1>(d, addr)?[0]);
                    d.push(v.into());
                }
                isa::I64_LOAD16_S => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i16::from_le_bytes(load::<2>(d, addr)?) as i64;
                    d.push(v.into());
                }
                isa::I64_LOAD16_U => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u64::from(u16::from_le_bytes(load::<2>(d, addr)?));
                    d.push(v.into());
                }
                isa::I64_LOAD32_S => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = i32::from_le_bytes(load::<4>(d, addr)?) as i64;
                    d.push(v.into());
                }
                isa::I64_LOAD32_U => {
                    let offset = read_memarg(&mut r);
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    let v = u64::from(u32::from_le_bytes(load::<4>(d, addr)?));
                    d.push(v.into());
                }

                isa::I32_STORE => {
                    let offset = read_memarg(&mut r);
                    let v = i32::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &v.to_le_bytes())?;
                }
                isa::I64_STORE => {
                    let offset = read_memarg(&mut r);
                    let v = i64::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &v.to_le_bytes())?;
                }
                isa::F32_STORE => {
                    let offset = read_memarg(&mut r);
                    let v = u32::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &v.to_le_bytes())?;
                }
                isa::F64_STORE => {
                    let offset = read_memarg(&mut r);
                    let v = u64::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &v.to_le_bytes())?;
                }
                isa::I32_STORE8 => {
                    let offset = read_memarg(&mut r);
                    let v = i32::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &[v as u8])?;
                }
                isa::I32_STORE16 => {
                    let offset = read_memarg(&mut r);
                    let v = i32::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &(v as u16).to_le_bytes())?;
                }
                isa::I64_STORE8 => {
                    let offset = read_memarg(&mut r);
                    let v = i64::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &[v as u8])?;
                }
                isa::I64_STORE16 => {
                    let offset = read_memarg(&mut r);
                    let v = i64::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &(v as u16).to_le_bytes())?;
                }
                isa::I64_STORE32 => {
                    let offset = read_memarg(&mut r);
                    let v = i64::from(d.pop());
                    let addr = offset.wrapping_add(u32::from(d.pop()));
                    store(d, addr, &(v as u32).to_le_bytes())?;
                }

                isa::MEMORY_SIZE => {
                    let memory_index = r.read_var_u32();
                    if memory_index != 0 {
                        return Err(trap_code(d, TrapCode::OnlyOneMemoryAllowed));
                    }
                    d.push((d.memory.current_pages().0 as i32).into());
                }
                isa::MEMORY_GROW => {
                    let memory_index = r.read_var_u32();
                    if memory_index != 0 {
                        return Err(trap_code(d, TrapCode::OnlyOneMemoryAllowed));
                    }
                    let additional = u32::from(d.top());
                    // New pages are recorded, not committed; the translator
                    // commits lazily on first touch.
                    match d.memory.grow_pages(additional) {
                        Some(previous) => d.set_top((previous as i32).into()),
                        None => d.set_top((-1i32).into()),
                    }
                    d.pc = r.pos;
                    d.gas -= 1;
                    if d.gas <= 0 {
                        return Ok(TickOutcome::NeedMoreGas);
                    }
                    continue;
                }

                isa::I32_CONST => {
                    let v = r.read_var_s(32) as i32;
                    d.push(v.into());
                }
                isa::I64_CONST => {
                    let v = r.read_var_s(64);
                    d.push(v.into());
                }
                isa::F32_CONST => {
                    let bits = r.read_u32_le();
                    d.push(ValueCell(u64::from(bits)));
                }
                isa::F64_CONST => {
                    let bits = r.read_u64_le();
                    d.push(ValueCell(bits));
                }

                // i32 comparisons.
                isa::I32_EQZ => unop::<i32, _>(d, |a| (a == 0) as i32),
                0x46 => cmp::<i32, _>(d, |a, b| a == b),
                0x47 => cmp::<i32, _>(d, |a, b| a != b),
                0x48 => cmp::<i32, _>(d, |a, b| a < b),
                0x49 => cmp::<u32, _>(d, |a, b| a < b),
                0x4a => cmp::<i32, _>(d, |a, b| a > b),
                0x4b => cmp::<u32, _>(d, |a, b| a > b),
                0x4c => cmp::<i32, _>(d, |a, b| a <= b),
                0x4d => cmp::<u32, _>(d, |a, b| a <= b),
                0x4e => cmp::<i32, _>(d, |a, b| a >= b),
                0x4f => cmp::<u32, _>(d, |a, b| a >= b),

                // i64 comparisons; results are i32.
                isa::I64_EQZ => {
                    let a = i64::from(d.top());
                    d.set_top(ValueCell::from((a == 0) as i32));
                }
                0x51 => cmp::<i64, _>(d, |a, b| a == b),
                0x52 => cmp::<i64, _>(d, |a, b| a != b),
                0x53 => cmp::<i64, _>(d, |a, b| a < b),
                0x54 => cmp::<u64, _>(d, |a, b| a < b),
                0x55 => cmp::<i64, _>(d, |a, b| a > b),
                0x56 => cmp::<u64, _>(d, |a, b| a > b),
                0x57 => cmp::<i64, _>(d, |a, b| a <= b),
                0x58 => cmp::<u64, _>(d, |a, b| a <= b),
                0x59 => cmp::<i64, _>(d, |a, b| a >= b),
                0x5a => cmp::<u64, _>(d, |a, b| a >= b),

                // Float comparisons, strict IEEE: NaN compares unequal.
                isa::F32_EQ => cmp::<f32, _>(d, |a, b| a == b),
                0x5c => cmp::<f32, _>(d, |a, b| a != b),
                0x5d => cmp::<f32, _>(d, |a, b| a < b),
                0x5e => cmp::<f32, _>(d, |a, b| a > b),
                0x5f => cmp::<f32, _>(d, |a, b| a <= b),
                0x60 => cmp::<f32, _>(d, |a, b| a >= b),
                isa::F64_EQ => cmp::<f64, _>(d, |a, b| a == b),
                0x62 => cmp::<f64, _>(d, |a, b| a != b),
                0x63 => cmp::<f64, _>(d, |a, b| a < b),
                0x64 => cmp::<f64, _>(d, |a, b| a > b),
                0x65 => cmp::<f64, _>(d, |a, b| a <= b),
                0x66 => cmp::<f64, _>(d, |a, b| a >= b),

                // i32 arithmetic.
                0x67 => unop::<u32, _>(d, Integer::leading_zeros),
                0x68 => unop::<u32, _>(d, Integer::trailing_zeros),
                0x69 => unop::<u32, _>(d, Integer::count_ones),
                0x6a => binop::<i32, _>(d, ArithmeticOps::add),
                0x6b => binop::<i32, _>(d, ArithmeticOps::sub),
                0x6c => binop::<i32, _>(d, ArithmeticOps::mul),
                0x6d => try_binop::<i32, _>(d, ArithmeticOps::div)?,
                0x6e => try_binop::<u32, _>(d, ArithmeticOps::div)?,
                0x6f => try_binop::<i32, _>(d, Integer::rem)?,
                0x70 => try_binop::<u32, _>(d, Integer::rem)?,
                0x71 => binop::<u32, _>(d, |a, b| a & b),
                0x72 => binop::<u32, _>(d, |a, b| a | b),
                0x73 => binop::<u32, _>(d, |a, b| a ^ b),
                // Shift counts are masked to the operand width.
                0x74 => binop::<u32, _>(d, |a, b| a.wrapping_shl(b)),
                0x75 => binop::<i32, _>(d, |a, b| a.wrapping_shr(b as u32)),
                0x76 => binop::<u32, _>(d, |a, b| a.wrapping_shr(b)),
                0x77 => binop::<u32, _>(d, Integer::rotl),
                0x78 => binop::<u32, _>(d, Integer::rotr),

                // i64 arithmetic.
                0x79 => unop::<u64, _>(d, Integer::leading_zeros),
                0x7a => unop::<u64, _>(d, Integer::trailing_zeros),
                0x7b => unop::<u64, _>(d, Integer::count_ones),
                0x7c => binop::<i64, _>(d, ArithmeticOps::add),
                0x7d => binop::<i64, _>(d, ArithmeticOps::sub),
                0x7e => binop::<i64, _>(d, ArithmeticOps::mul),
                0x7f => try_binop::<i64, _>(d, ArithmeticOps::div)?,
                0x80 => try_binop::<u64, _>(d, ArithmeticOps::div)?,
                0x81 => try_binop::<i64, _>(d, Integer::rem)?,
                0x82 => try_binop::<u64, _>(d, Integer::rem)?,
                0x83 => binop::<u64, _>(d, |a, b| a & b),
                0x84 => binop::<u64, _>(d, |a, b| a | b),
                0x85 => binop::<u64, _>(d, |a, b| a ^ b),
                0x86 => binop::<u64, _>(d, |a, b| a.wrapping_shl(b as u32)),
                0x87 => binop::<i64, _>(d, |a, b| a.wrapping_shr(b as u32)),
                0x88 => binop::<u64, _>(d, |a, b| a.wrapping_shr(b as u32)),
                0x89 => binop::<u64, _>(d, Integer::rotl),
                0x8a => binop::<u64, _>(d, Integer::rotr),

                // f32 arithmetic.
                0x8b => unop::<f32, _>(d, Float::abs),
                0x8c => unop::<f32, _>(d, |a| -a),
                0x8d => unop::<f32, _>(d, Float::ceil),
                0x8e => unop::<f32, _>(d, Float::floor),
                0x8f => unop::<f32, _>(d, Float::trunc),
                0x90 => unop::<f32, _>(d, Float::nearest),
                0x91 => unop::<f32, _>(d, Float::sqrt),
                0x92 => binop::<f32, _>(d, ArithmeticOps::add),
                0x93 => binop::<f32, _>(d, ArithmeticOps::sub),
                0x94 => binop::<f32, _>(d, ArithmeticOps::mul),
                0x95 => try_binop::<f32, _>(d, ArithmeticOps::div)?,
                0x96 => binop::<f32, _>(d, Float::min),
                0x97 => binop::<f32, _>(d, Float::max),
                0x98 => binop::<f32, _>(d, Float::copysign),

                // f64 arithmetic.
                0x99 => unop::<f64, _>(d, Float::abs),
                0x9a => unop::<f64, _>(d, |a| -a),
                0x9b => unop::<f64, _>(d, Float::ceil),
                0x9c => unop::<f64, _>(d, Float::floor),
                0x9d => unop::<f64, _>(d, Float::trunc),
                0x9e => unop::<f64, _>(d, Float::nearest),
                0x9f => unop::<f64, _>(d, Float::sqrt),
                0xa0 => binop::<f64, _>(d, ArithmeticOps::add),
                0xa1 => binop::<f64, _>(d, ArithmeticOps::sub),
                0xa2 => binop::<f64, _>(d, ArithmeticOps::mul),
                0xa3 => try_binop::<f64, _>(d, ArithmeticOps::div)?,
                0xa4 => binop::<f64, _>(d, Float::min),
                0xa5 => binop::<f64, _>(d, Float::max),
                0xa6 => binop::<f64, _>(d, Float::copysign),

                // Conversions.
                isa::I32_WRAP_I64 => {
                    let a = d.top();
                    d.set_top(ValueCell(a.0 & 0x0000_0000_ffff_ffff));
                }
                0xa8 => try_cvt::<f32, i32, _>(d, TryTruncateInto::try_truncate_into)?,
                0xa9 => try_cvt::<f32, u32, _>(d, TryTruncateInto::try_truncate_into)?,
                0xaa => try_cvt::<f64, i32, _>(d, TryTruncateInto::try_truncate_into)?,
                0xab => try_cvt::<f64, u32, _>(d, TryTruncateInto::try_truncate_into)?,
                isa::I64_EXTEND_I32_S => cvt::<i32, i64, _>(d, i64::from),
                isa::I64_EXTEND_I32_U => cvt::<u32, u64, _>(d, u64::from),
                0xae => try_cvt::<f32, i64, _>(d, TryTruncateInto::try_truncate_into)?,
                0xaf => try_cvt::<f32, u64, _>(d, TryTruncateInto::try_truncate_into)?,
                0xb0 => try_cvt::<f64, i64, _>(d, TryTruncateInto::try_truncate_into)?,
                0xb1 => try_cvt::<f64, u64, _>(d, TryTruncateInto::try_truncate_into)?,
                0xb2 => cvt::<i32, f32, _>(d, |a| a as f32),
                0xb3 => cvt::<u32, f32, _>(d, |a| a as f32),
                0xb4 => cvt::<i64, f32, _>(d, |a| a as f32),
                0xb5 => cvt::<u64, f32, _>(d, |a| a as f32),
                0xb6 => cvt::<f64, f32, _>(d, |a| a as f32),
                0xb7 => cvt::<i32, f64, _>(d, f64::from),
                0xb8 => cvt::<u32, f64, _>(d, f64::from),
                0xb9 => cvt::<i64, f64, _>(d, |a| a as f64),
                0xba => cvt::<u64, f64, _>(d, |a| a as f64),
                0xbb => cvt::<f32, f64, _>(d, f64::from),
                // Reinterpretations: the cell already holds the bits.
                0xbc | 0xbd | 0xbe | 0xbf => {}

                isa::I32_EXTEND8_S => unop::<i32, _>(d, |a| a as i8 as i32),
                isa::I32_EXTEND16_S => unop::<i32, _>(d, |a| a as i16 as i32),
                isa::I64_EXTEND8_S => unop::<i64, _>(d, |a| a as i8 as i64),
                isa::I64_EXTEND16_S => unop::<i64, _>(d, |a| a as i16 as i64),
                isa::I64_EXTEND32_S => unop::<i64, _>(d, |a| a as i32 as i64),

                isa::MISC_PREFIX => {
                    let sub_opcode = r.read_var_u32();
                    return Err(d.trap(
                        TrapCode::SaturatingTruncationNotSupported,
                        &format!("{:#x}", sub_opcode),
                    ));
                }
                isa::VECTOR_PREFIX => {
                    let sub_opcode = r.read_var_u32();
                    return Err(d.trap(
                        TrapCode::VectorsNotSupported,
                        &format!("no vectors implemented {:#x} {:#x}", opcode, sub_opcode),
                    ));
                }
                _ => {
                    return Err(d.trap(
                        TrapCode::UnknownOpcode,
                        &format!("unrecognized opcode {:#x}", opcode),
                    ));
                }
            }
            d.pc = r.pos;
        }
    }
}

/// Drop `label` entries and transfer to the branch target of the entry then
/// on top. For a `block` that is its `end` (which pops it); for a `loop` it
/// is the body start, and the entry stays for the next iteration.
fn branch(d: &mut Instance, code: &[u8], label: u32) -> Result<(), Trap> {
    if label as usize >= d.blocks.len() {
        return Err(d.trap(TrapCode::LabelOutOfRange, "branch stack under run"));
    }
    let keep = d.blocks.len() - label as usize;
    d.blocks.truncate(keep);
    match d.blocks.last().and_then(BlockEntry::branch_target) {
        Some(target) if target <= code.len() => {
            d.pc = target;
            Ok(())
        }
        _ => Err(trap_code(d, TrapCode::BranchOutOfRange)),
    }
}

/// Execute an initialiser expression: a short bytecode sequence at the
/// current program counter, terminated by `end`, yielding one value of
/// `result_type` on the operand stack.
pub(crate) fn run_init_expr(
    m: &Module,
    d: &mut Instance,
    result_type: ValueType,
) -> Result<(), Trap> {
    debug_assert_eq!(d.sp, SP_INITIAL);
    d.blocks.push(BlockEntry {
        type_index: result_type.block_type_index(),
        kind: BlockKind::InitExpr,
        stack_pointer: SP_INITIAL,
    });
    d.fp = d.sp.wrapping_add(1);

    // One gas budget bounds the whole expression; a constant expression
    // that does not reach its end within it is malformed.
    match m.tick(d)? {
        TickOutcome::Done => {}
        TickOutcome::NeedMoreGas => {
            return Err(d.trap(
                TrapCode::MissingEnd,
                "initialiser expression did not complete",
            ))
        }
    }
    if d.sp == SP_INITIAL {
        return Err(trap_code(d, TrapCode::NoResultOnStack));
    }
    Ok(())
}
