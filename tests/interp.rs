//! End-to-end interpreter scenarios driven through the public API.

use assert_matches::assert_matches;
use std::cell::RefCell;
use std::rc::Rc;
use wasmtick::{Imports, Instance, Module, TickOutcome, Trap, TrapCode, Value, ValueType};

fn compile(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("test module assembles")
}

fn load(wat: &str) -> (Module, Instance) {
    load_with(wat, &Imports::new())
}

fn load_with(wat: &str, imports: &Imports) -> (Module, Instance) {
    let wasm = compile(wat);
    let mut inst = Instance::new();
    let module = Module::load(&wasm, imports, &mut inst).expect("test module loads");
    module.instantiate(&mut inst).expect("test module instantiates");
    (module, inst)
}

/// Set up a call to the named export and drive it to completion.
fn run(module: &Module, inst: &mut Instance, name: &str) -> Result<(), Trap> {
    let index = module.export(name).expect("export exists");
    let mut outcome = module.call_exported(inst, index)?;
    while outcome == TickOutcome::NeedMoreGas {
        outcome = module.tick(inst)?;
    }
    Ok(())
}

#[test]
fn hello_world_reaches_the_host_fd_write() {
    let captured: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let fds: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = captured.clone();
    let fd_log = fds.clone();

    let mut imports = Imports::new();
    imports
        .register("wasi_snapshot_preview1/fd_write", move |d: &mut Instance| {
            let nwritten_offset = d.pop_arg_u32();
            let iovs_len = d.pop_arg_u32();
            let iovs_offset = d.pop_arg_u32();
            let fd = d.pop_arg_i64();
            fd_log.borrow_mut().push(fd);

            let mut written = 0u32;
            for i in 0..iovs_len {
                let iov = d
                    .memory_mut()
                    .load_bytes::<8>(iovs_offset + 8 * i)
                    .expect("iovec is mapped");
                let buf = u32::from_le_bytes([iov[0], iov[1], iov[2], iov[3]]);
                let len = u32::from_le_bytes([iov[4], iov[5], iov[6], iov[7]]);
                let bytes = d
                    .memory_mut()
                    .translate(buf, len as usize)
                    .expect("buffer is mapped")
                    .to_vec();
                sink.borrow_mut().extend_from_slice(&bytes);
                written += len;
            }
            d.memory_mut()
                .store_bytes(nwritten_offset, &written.to_le_bytes())
                .expect("nwritten is mapped");
            d.push_result_i64(0);
        })
        .unwrap();

    let (module, mut inst) = load_with(
        r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory 1)
            (data (i32.const 64) "hello, world\0a")
            (func (export "_start")
                ;; iovec { buf = 64, len = 13 } at address 0
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 13))
                (call $fd_write
                    (i32.const 1)
                    (i32.const 0)
                    (i32.const 1)
                    (i32.const 24))
                drop))
        "#,
        &imports,
    );

    run(&module, &mut inst, "_start").unwrap();
    assert_eq!(captured.borrow().as_slice(), b"hello, world\n");
    assert_eq!(fds.borrow().as_slice(), &[1]);
    assert_eq!(inst.stack_height(), 0);
}

#[test]
fn wrap_keeps_the_low_32_bits() {
    let (module, mut inst) = load(
        r#"
        (module
            (func (export "wrap") (param i64) (result i32)
                local.get 0
                i32.wrap_i64))
        "#,
    );
    inst.push_value(Value::I64(0x1_0000_0001));
    run(&module, &mut inst, "wrap").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(1));
}

#[test]
fn wrap_then_extend_recovers_sign_extended_low_half() {
    let (module, mut inst) = load(
        r#"
        (module
            (func (export "law") (param i64) (result i64)
                local.get 0
                i32.wrap_i64
                i64.extend_i32_s))
        "#,
    );
    inst.push_value(Value::I64(0x1234_5678_8000_0001u64 as i64));
    run(&module, &mut inst, "law").unwrap();
    assert_eq!(
        inst.pop_value(ValueType::I64),
        Value::I64(0xffff_ffff_8000_0001u64 as i64)
    );
}

#[test]
fn signed_division_traps_with_distinct_codes() {
    let source = r#"
        (module
            (func (export "div") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.div_s))
    "#;

    let (module, mut inst) = load(source);
    inst.push_value(Value::I32(i32::MIN));
    inst.push_value(Value::I32(-1));
    let trap = run(&module, &mut inst, "div").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::IntegerOverflow);
    assert!(inst.sentinel_intact());

    let (module, mut inst) = load(source);
    inst.push_value(Value::I32(5));
    inst.push_value(Value::I32(0));
    let trap = run(&module, &mut inst, "div").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::DivisionByZero);
    assert!(inst.sentinel_intact());
}

#[test]
fn gas_exhaustion_suspends_and_resumes() {
    let (module, mut inst) = load(
        r#"
        (module
            (func (export "spin") (param i32)
                (local $i i32)
                local.get 0
                local.set $i
                (block $out
                    (loop $top
                        local.get $i
                        i32.eqz
                        br_if $out
                        local.get $i
                        i32.const 1
                        i32.sub
                        local.set $i
                        br $top))))
        "#,
    );

    let iterations: i64 = 100_000;
    inst.push_value(Value::I32(iterations as i32));
    let spin = module.export("spin").unwrap();

    let mut outcome = module.call_exported(&mut inst, spin).unwrap();
    assert_eq!(outcome, TickOutcome::NeedMoreGas);

    let mut total_gas = inst.gas_per_tick() - inst.gas_remaining();
    let mut ticks = 1u32;
    while outcome == TickOutcome::NeedMoreGas {
        outcome = module.tick(&mut inst).unwrap();
        total_gas += inst.gas_per_tick() - inst.gas_remaining();
        ticks += 1;
    }

    // Control opcodes only: block + loop once, br_if + br per iteration,
    // the final taken br_if, and the block end.
    assert_eq!(total_gas, 2 * iterations + 4);
    assert!(ticks >= 3);
    assert_eq!(inst.stack_height(), 0);
}

#[test]
fn indirect_call_with_wrong_type_traps_without_calling() {
    let (module, mut inst) = load(
        r#"
        (module
            (type $ii (func (param i32) (result i32)))
            (type $ll (func (param i64) (result i64)))
            (table 1 funcref)
            (elem (i32.const 0) $target)
            (func $pad0 nop)
            (func $pad1 nop)
            (func $pad2 nop)
            (func $target (type $ii)
                local.get 0)
            (func (export "go") (result i64)
                i64.const 7
                i32.const 0
                call_indirect (type $ll)))
        "#,
    );

    let trap = run(&module, &mut inst, "go").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::IndirectCallTypeMismatch);
    assert!(inst.sentinel_intact());
    assert!(inst.has_exception());
}

#[test]
fn split_memory_serves_low_and_high_addresses() {
    let (module, mut inst) = load(
        r#"
        (module
            (memory 65280)
            (func (export "poke") (param i32 i32)
                local.get 0
                local.get 1
                i32.store8)
            (func (export "peek") (param i32) (result i32)
                local.get 0
                i32.load8_u))
        "#,
    );

    let poke = |inst: &mut Instance, addr: u32, value: i32| {
        inst.push_value(Value::I32(addr as i32));
        inst.push_value(Value::I32(value));
        run(&module, inst, "poke").unwrap();
    };
    poke(&mut inst, 0x10, 0xaa);
    poke(&mut inst, 0xfe00_0000u32, 0xbb);
    poke(&mut inst, 0x20, 0xcc);

    let peek = |inst: &mut Instance, addr: u32| -> i32 {
        inst.push_value(Value::I32(addr as i32));
        run(&module, inst, "peek").unwrap();
        match inst.pop_value(ValueType::I32) {
            Value::I32(v) => v,
            other => panic!("unexpected result {:?}", other),
        }
    };
    assert_eq!(peek(&mut inst, 0x10), 0xaa);
    assert_eq!(peek(&mut inst, 0xfe00_0000u32), 0xbb);
    assert_eq!(peek(&mut inst, 0x20), 0xcc);

    // Both regions are committed and disjoint.
    let lower = inst.memory().lower_committed();
    let (upper_begin, upper_end) = inst.memory().upper_window().expect("upper is committed");
    assert!(lower > 0);
    assert!(lower <= upper_begin);
    assert!(upper_begin <= 0xfe00_0000 && 0xfe00_0001 <= upper_end);
}

#[test]
fn branch_table_clamps_to_the_default_label() {
    let (module, mut inst) = load(
        r#"
        (module
            (func (export "pick") (param i32) (result i32)
                (block $default
                    (block $one
                        (block $zero
                            local.get 0
                            br_table $zero $one $default)
                        (return (i32.const 100)))
                    (return (i32.const 101)))
                i32.const 102))
        "#,
    );

    let pick = |inst: &mut Instance, index: i32| -> Value {
        inst.push_value(Value::I32(index));
        run(&module, inst, "pick").unwrap();
        inst.pop_value(ValueType::I32)
    };
    assert_eq!(pick(&mut inst, 0), Value::I32(100));
    assert_eq!(pick(&mut inst, 1), Value::I32(101));
    // The default slot index itself, and far out of range in both
    // directions, all land on the default label.
    assert_eq!(pick(&mut inst, 2), Value::I32(102));
    assert_eq!(pick(&mut inst, 99_999), Value::I32(102));
    assert_eq!(pick(&mut inst, -3), Value::I32(102));
}

#[test]
fn float_truncation_traps_by_kind() {
    let source = r#"
        (module
            (func (export "t") (param f32) (result i32)
                local.get 0
                i32.trunc_f32_s))
    "#;

    for (input, expected) in [
        (f32::NAN, TrapCode::InvalidConversionToInt),
        (f32::INFINITY, TrapCode::IntegerOverflow),
        (f32::NEG_INFINITY, TrapCode::IntegerOverflow),
        (3.0e9, TrapCode::IntegerOverflow),
    ] {
        let (module, mut inst) = load(source);
        inst.push_value(Value::F32(input));
        let trap = run(&module, &mut inst, "t").unwrap_err();
        assert_eq!(trap.kind(), expected, "input {}", input);
    }

    let (module, mut inst) = load(source);
    inst.push_value(Value::F32(-2.75));
    run(&module, &mut inst, "t").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(-2));
}

#[test]
fn memory_grow_returns_previous_size_and_commits_lazily() {
    let (module, mut inst) = load(
        r#"
        (module
            (memory 1 4)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow)
            (func (export "size") (result i32)
                memory.size)
            (func (export "peek") (param i32) (result i32)
                local.get 0
                i32.load))
        "#,
    );

    let call1 = |inst: &mut Instance, name: &str, arg: i32| -> i32 {
        inst.push_value(Value::I32(arg));
        run(&module, inst, name).unwrap();
        match inst.pop_value(ValueType::I32) {
            Value::I32(v) => v,
            other => panic!("unexpected result {:?}", other),
        }
    };

    assert_eq!(call1(&mut inst, "grow", 1), 1);
    run(&module, &mut inst, "size").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(2));

    // A load inside the newly recorded page succeeds.
    assert_eq!(call1(&mut inst, "peek", 0x1_0008), 0);
    // Growing past the declared maximum fails with -1.
    assert_eq!(call1(&mut inst, "grow", 100), -1);
}

#[test]
fn unreachable_traps_and_leaves_a_message() {
    let (module, mut inst) = load(
        r#"
        (module (func (export "boom") unreachable))
        "#,
    );
    let trap = run(&module, &mut inst, "boom").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::UnreachableExecuted);
    assert_eq!(inst.exception(), "unreachable");
}

#[test]
fn start_function_runs_on_the_first_tick() {
    let (module, mut inst) = load(
        r#"
        (module
            (global $ran (mut i32) (i32.const 0))
            (func $init
                i32.const 1
                global.set $ran)
            (start $init)
            (func (export "ran") (result i32)
                global.get $ran))
        "#,
    );

    // instantiate left the start frame pending; drive it first.
    let mut outcome = module.tick(&mut inst).unwrap();
    while outcome == TickOutcome::NeedMoreGas {
        outcome = module.tick(&mut inst).unwrap();
    }

    run(&module, &mut inst, "ran").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(1));
}

#[test]
fn completed_instance_reports_done_on_further_ticks() {
    let (module, mut inst) = load(r#"(module (func (export "f") nop))"#);
    run(&module, &mut inst, "f").unwrap();
    assert_eq!(module.tick(&mut inst).unwrap(), TickOutcome::Done);
}

#[test]
fn host_exception_surfaces_as_a_trap() {
    let mut imports = Imports::new();
    imports
        .register("env/fail", |d: &mut Instance| {
            d.set_exception("deliberate failure");
        })
        .unwrap();
    let (module, mut inst) = load_with(
        r#"
        (module
            (import "env" "fail" (func $fail))
            (func (export "go") call $fail))
        "#,
        &imports,
    );
    let trap = run(&module, &mut inst, "go").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::HostFunctionError);
    assert_eq!(inst.exception(), "deliberate failure");
}

#[test]
fn loop_with_result_yields_its_value() {
    // A value-typed block signature exercises the negative block-type
    // encodings.
    let (module, mut inst) = load(
        r#"
        (module
            (func (export "count") (result i32)
                (local $i i32)
                (block $out (result i32)
                    (loop $top (result i32)
                        local.get $i
                        i32.const 1
                        i32.add
                        local.set $i
                        local.get $i
                        i32.const 5
                        i32.ge_u
                        (if (result i32)
                            (then local.get $i)
                            (else br $top))))))
        "#,
    );
    run(&module, &mut inst, "count").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(5));
}
