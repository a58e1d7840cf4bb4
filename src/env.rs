//! Host-environment shim: the WASI and emscripten imports a typical
//! C/C++ guest expects, plus the loop that drives an instance to
//! completion under gas and memory budgets.
//!
//! Everything here sits on the public embedding surface — host functions
//! pop their parameters in reverse order, push results, translate guest
//! addresses and report failure through the exception buffer. An embedder
//! wanting different I/O registers its own callbacks instead.

use crate::instance::Instance;
use crate::memory::LINEAR_MEMORY_PAGE_SIZE;
use crate::module::Module;
use crate::runner::TickOutcome;
use crate::value::Value;
use crate::{Imports, Trap, TrapCode};
use std::io::{Read, Write};
use tracing::debug;

const WASI_ESUCCESS: i64 = 0;

/// Default cap on instance memory, checked between ticks.
pub const DEFAULT_MEMORY_QUOTA: usize = 0x1000_0000;

/// Entry points searched, in order, when the caller names none.
pub const ENTRY_POINT_CANDIDATES: &[&str] = &["__main_argc_argv", "main", "_start", "start", "test"];

/// WASI scatter-gather element: guest pointer and length.
fn read_iovec(d: &mut Instance, addr: u32) -> Option<(u32, u32)> {
    let bytes = d.memory_mut().load_bytes::<8>(addr)?;
    let buf = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Some((buf, len))
}

fn fd_write(d: &mut Instance) {
    if !d.expect_params(4) {
        return;
    }
    // Last-declared parameter pops first.
    let nwritten_offset = d.pop_arg_u32();
    let iovs_len = d.pop_arg_u32();
    let iovs_offset = d.pop_arg_u32();
    let fd = d.pop_arg_i64() as i32;

    let mut written: u32 = 0;
    for i in 0..iovs_len {
        let (buf, len) = match read_iovec(d, iovs_offset.wrapping_add(8 * i)) {
            Some(iov) => iov,
            None => {
                d.set_exception("fd_write: iovec out of range");
                return;
            }
        };
        let bytes = match d.memory_mut().translate(buf, len as usize) {
            Some(slice) => slice.to_vec(),
            None => {
                d.set_exception("fd_write: buffer out of range");
                return;
            }
        };
        let result = match fd {
            1 => std::io::stdout().write_all(&bytes),
            2 => std::io::stderr().write_all(&bytes),
            _ => {
                d.set_exception(&format!("fd_write: unsupported fd {}", fd));
                return;
            }
        };
        if result.is_err() {
            d.set_exception("fd_write: host write failed");
            return;
        }
        written = written.wrapping_add(len);
    }
    if d
        .memory_mut()
        .store_bytes(nwritten_offset, &written.to_le_bytes())
        .is_none()
    {
        d.set_exception("fd_write: nwritten out of range");
        return;
    }
    d.push_result_i64(WASI_ESUCCESS);
}

fn fd_read(d: &mut Instance) {
    if !d.expect_params(4) {
        return;
    }
    let nread_offset = d.pop_arg_u32();
    let iovs_len = d.pop_arg_u32();
    let iovs_offset = d.pop_arg_u32();
    let fd = d.pop_arg_i64() as i32;
    if fd != 0 {
        d.set_exception(&format!("fd_read: unsupported fd {}", fd));
        return;
    }

    let mut total: u32 = 0;
    for i in 0..iovs_len {
        let (buf, len) = match read_iovec(d, iovs_offset.wrapping_add(8 * i)) {
            Some(iov) => iov,
            None => {
                d.set_exception("fd_read: iovec out of range");
                return;
            }
        };
        let mut scratch = vec![0u8; len as usize];
        let n = match std::io::stdin().read(&mut scratch) {
            Ok(n) => n,
            Err(_) => {
                d.set_exception("fd_read: host read failed");
                return;
            }
        };
        if d.memory_mut().store_bytes(buf, &scratch[..n]).is_none() {
            d.set_exception("fd_read: buffer out of range");
            return;
        }
        total = total.wrapping_add(n as u32);
        if n < len as usize {
            break;
        }
    }
    if d
        .memory_mut()
        .store_bytes(nread_offset, &total.to_le_bytes())
        .is_none()
    {
        d.set_exception("fd_read: nread out of range");
        return;
    }
    d.push_result_i64(WASI_ESUCCESS);
}

fn fd_close(d: &mut Instance) {
    if !d.expect_params(1) {
        return;
    }
    let _fd = d.pop_arg_i64();
    d.push_result_i64(WASI_ESUCCESS);
}

fn fd_seek(d: &mut Instance) {
    if !d.expect_params(5) {
        return;
    }
    for _ in 0..5 {
        d.pop_arg_i64();
    }
    d.set_exception("not implemented: wasi_snapshot_preview1/fd_seek");
    d.push_result_i64(WASI_ESUCCESS);
}

fn proc_exit(d: &mut Instance) {
    if !d.expect_params(1) {
        return;
    }
    let exit_code = d.pop_arg_i64();
    // Surfaces as a host trap; the front-end turns it into the process
    // exit code.
    d.set_exception(&format!("exit {}", exit_code));
    d.push_result_i64(exit_code);
}

fn args_sizes_get(d: &mut Instance) {
    if !d.expect_params(2) {
        return;
    }
    let argv_buf_size_ptr = d.pop_arg_u32();
    let argc_ptr = d.pop_arg_u32();
    let argc = d.cli_arguments().len() as u32;
    let strings: u32 = d
        .cli_arguments()
        .iter()
        .map(|a| a.len() as u32 + 1)
        .sum();
    if d
        .memory_mut()
        .store_bytes(argc_ptr, &argc.to_le_bytes())
        .is_none()
        || d.memory_mut()
            .store_bytes(argv_buf_size_ptr, &strings.to_le_bytes())
            .is_none()
    {
        d.set_exception("args_sizes_get: out of range");
        return;
    }
    d.push_result_i64(WASI_ESUCCESS);
}

fn args_get(d: &mut Instance) {
    if !d.expect_params(2) {
        return;
    }
    let mut argv_buf = d.pop_arg_u32();
    let argv = d.pop_arg_u32();
    let args = d.cli_arguments().to_vec();
    for (i, arg) in args.iter().enumerate() {
        let pointer_ok = d
            .memory_mut()
            .store_bytes(argv.wrapping_add(4 * i as u32), &argv_buf.to_le_bytes())
            .is_some();
        let string_ok = d
            .memory_mut()
            .store_bytes(argv_buf, arg.as_bytes())
            .is_some()
            && d.memory_mut()
                .store_bytes(argv_buf.wrapping_add(arg.len() as u32), &[0])
                .is_some();
        if !pointer_ok || !string_ok {
            d.set_exception("args_get: out of range");
            return;
        }
        argv_buf = argv_buf.wrapping_add(arg.len() as u32 + 1);
    }
    d.push_result_i64(WASI_ESUCCESS);
}

fn memcpy_big(d: &mut Instance) {
    if !d.expect_params(3) {
        return;
    }
    let num = d.pop_arg_u32();
    let src = d.pop_arg_u32();
    let dest = d.pop_arg_u32();
    let bytes = match d.memory_mut().translate(src, num as usize) {
        Some(slice) => slice.to_vec(),
        None => {
            d.set_exception("memcpy: source out of range");
            return;
        }
    };
    if d.memory_mut().store_bytes(dest, &bytes).is_none() {
        d.set_exception("memcpy: destination out of range");
        return;
    }
    d.push_result_i64(WASI_ESUCCESS);
}

fn emscripten_resize_heap(d: &mut Instance) {
    if !d.expect_params(1) {
        return;
    }
    let requested = d.pop_arg_i64() as u64;
    let page_size = LINEAR_MEMORY_PAGE_SIZE.0 as u64;
    let pages = requested.div_ceil(page_size) as u32;
    debug!(requested, pages, "emscripten_resize_heap");
    d.memory_mut().set_current_pages(pages);
    let new_size = d.memory().byte_size() as i64;
    d.push_result_i64(new_size);
}

fn set_temp_ret0(d: &mut Instance) {
    d.temp_ret0 = d.pop_arg_i64() as u64;
}

fn get_temp_ret0(d: &mut Instance) {
    let v = d.temp_ret0 as i64;
    d.push_result_i64(v);
}

fn read_c_string(d: &mut Instance, addr: u32) -> String {
    let mut out = Vec::new();
    let mut at = addr;
    loop {
        match d.memory_mut().load_bytes::<1>(at) {
            Some([0]) | None => break,
            Some([b]) => out.push(b),
        }
        if out.len() >= 256 {
            break;
        }
        at = at.wrapping_add(1);
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn assert_fail(d: &mut Instance) {
    if !d.expect_params(4) {
        return;
    }
    let _function = d.pop_arg_u32();
    let line = d.pop_arg_u32();
    let file = d.pop_arg_u32();
    let assertion = d.pop_arg_u32();
    let assertion = read_c_string(d, assertion);
    let file = read_c_string(d, file);
    d.set_exception(&format!(
        "assertion failed: {} at {}:{}",
        assertion, file, line
    ));
}

/// Syscalls the shim does not forward to the host OS; each pops its
/// parameters and reports itself through the exception buffer.
fn unimplemented_syscall(name: &'static str, params: u16) -> impl Fn(&mut Instance) {
    move |d: &mut Instance| {
        if !d.expect_params(params) {
            return;
        }
        for _ in 0..params {
            d.pop_arg_i64();
        }
        d.set_exception(&format!("not implemented: {}", name));
        d.push_result_i64(WASI_ESUCCESS);
    }
}

/// Register the full shim. A sandboxing host can pick a subset instead.
pub fn register_host_functions(imports: &mut Imports) -> Result<(), Trap> {
    imports.register("wasi_snapshot_preview1/fd_write", fd_write)?;
    imports.register("wasi_snapshot_preview1/fd_read", fd_read)?;
    imports.register("wasi_snapshot_preview1/fd_close", fd_close)?;
    imports.register("wasi_snapshot_preview1/fd_seek", fd_seek)?;
    imports.register("wasi_snapshot_preview1/args_sizes_get", args_sizes_get)?;
    imports.register("wasi_snapshot_preview1/args_get", args_get)?;
    imports.register("wasi_snapshot_preview1/proc_exit", proc_exit)?;

    imports.register("env/__assert_fail", assert_fail)?;
    imports.register("env/emscripten_memcpy_big", memcpy_big)?;
    imports.register("env/emscripten_memcpy_js", memcpy_big)?;
    imports.register("env/emscripten_resize_heap", emscripten_resize_heap)?;
    imports.register("env/setTempRet0", set_temp_ret0)?;
    imports.register("env/getTempRet0", get_temp_ret0)?;

    for (name, params) in [
        ("env/__syscall_open", 3),
        ("env/__syscall_fcntl64", 3),
        ("env/__syscall_ioctl", 3),
        ("env/__syscall_getcwd", 2),
        ("env/__syscall_readlink", 3),
        ("env/__syscall_fstat64", 2),
        ("env/__syscall_stat64", 2),
        ("env/__syscall_lstat64", 2),
        ("env/__syscall_fstatat64", 4),
        ("env/__syscall_getdents64", 3),
    ] {
        imports.register(name, unimplemented_syscall(name, params))?;
    }
    Ok(())
}

/// First exported entry point found, searched in the conventional order.
pub fn find_entry_point(module: &Module) -> Option<u32> {
    ENTRY_POINT_CANDIDATES
        .iter()
        .find_map(|name| module.export(name))
}

/// Run `__wasm_call_ctors` when the module exports it.
pub fn call_ctors(module: &Module, d: &mut Instance) -> Result<(), Trap> {
    if let Some(index) = module.export("__wasm_call_ctors") {
        run_function(module, d, index)?;
    }
    Ok(())
}

/// Query `__errno_location` once and remember the guest address.
pub fn locate_errno(module: &Module, d: &mut Instance) -> Result<(), Trap> {
    if let Some(index) = module.export("__errno_location") {
        run_function(module, d, index)?;
        d.errno_location = d.pop_arg_u32();
    }
    Ok(())
}

fn run_function(module: &Module, d: &mut Instance, func_index: u32) -> Result<(), Trap> {
    let mut outcome = module.call_exported(d, func_index)?;
    while outcome == TickOutcome::NeedMoreGas {
        outcome = module.tick(d)?;
    }
    Ok(())
}

/// Drive `func_index` to completion, resuming across gas exhaustion and
/// enforcing `memory_quota` between ticks. Returns total gas spent.
pub fn call_and_run(
    module: &Module,
    d: &mut Instance,
    func_index: u32,
    memory_quota: usize,
) -> Result<i64, Trap> {
    let mut outcome = module.call_exported(d, func_index)?;
    let mut total_gas = d.gas_per_tick() - d.gas_remaining();
    loop {
        if d.total_memory_usage() + module.byte_len() > memory_quota {
            return Err(d.trap(
                TrapCode::MemoryQuotaExceeded,
                &format!(
                    "memory quota exceeded: {} > {}",
                    d.total_memory_usage() + module.byte_len(),
                    memory_quota
                ),
            ));
        }
        match outcome {
            TickOutcome::Done => return Ok(total_gas),
            TickOutcome::NeedMoreGas => {
                outcome = module.tick(d)?;
                total_gas += d.gas_per_tick() - d.gas_remaining();
            }
        }
    }
}

/// Drain the values left on the operand stack after a completed run.
/// Returns the bottom-most value (the guest's return value by the calling
/// convention) and every drained value, top first, typed where the
/// signature says how.
pub fn drain_results(module: &Module, d: &mut Instance, func_index: u32) -> (i64, Vec<Value>) {
    let results: Vec<_> = module
        .func_type_of(func_index)
        .map(|ty| ty.results().to_vec())
        .unwrap_or_default();
    let mut drained = Vec::new();
    let mut return_value = 0i64;
    while d.stack_height() > 0 {
        let slot = d.stack_height() as usize - 1;
        let cell = d.pop();
        return_value = cell.0 as i64;
        let value = match results.get(slot) {
            Some(ty) => cell.with_type(*ty),
            None => Value::I64(cell.0 as i64),
        };
        drained.push(value);
    }
    d.clear_exception();
    (return_value, drained)
}
