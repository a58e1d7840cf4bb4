//! Decoder-level properties: section handling, limits, and explicit
//! rejection of features outside the supported subset.

use assert_matches::assert_matches;
use wasmtick::{Imports, Instance, Module, TickOutcome, Trap, TrapCode, Value, ValueType};

fn compile(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("test module assembles")
}

fn load_bytes(wasm: &[u8]) -> Result<(Module, Instance), Trap> {
    let mut inst = Instance::new();
    let module = Module::load(wasm, &Imports::new(), &mut inst)?;
    module.instantiate(&mut inst)?;
    Ok((module, inst))
}

fn load(wat: &str) -> (Module, Instance) {
    load_bytes(&compile(wat)).expect("test module loads")
}

fn run(module: &Module, inst: &mut Instance, name: &str) -> Result<(), Trap> {
    let index = module.export(name).expect("export exists");
    let mut outcome = module.call_exported(inst, index)?;
    while outcome == TickOutcome::NeedMoreGas {
        outcome = module.tick(inst)?;
    }
    Ok(())
}

#[test]
fn every_code_range_ends_with_the_end_opcode() {
    let (module, _) = load(
        r#"
        (module
            (func $a (result i32) i32.const 1)
            (func $b (param i32) (result i32)
                local.get 0
                (if (result i32)
                    (then i32.const 2)
                    (else i32.const 3)))
            (func (export "c") nop))
        "#,
    );
    assert!(module.func_count() >= 3);
    for index in 0..module.func_count() {
        let (start, end) = module.code_range(index).expect("internal function");
        assert!(start < end);
        assert_eq!(module.bytes()[end], 0x0b, "function {}", index);
    }
}

#[test]
fn memory_with_initial_above_maximum_is_rejected() {
    // (memory 2 1) hand-encoded; assemblers refuse to emit it.
    let bytes = [
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x05, 0x04, // memory section, 4 bytes
        0x01, 0x01, 0x02, 0x01, // one memory, flags=1, initial=2, max=1
    ];
    let err = load_bytes(&bytes).unwrap_err();
    assert_matches!(err.kind(), TrapCode::InvalidMemoryLimits);
}

#[test]
fn function_exports_are_recorded_and_others_ignored() {
    let (module, _) = load(
        r#"
        (module
            (memory (export "memory") 1)
            (global (export "g") i32 (i32.const 3))
            (func (export "f") (result i32) i32.const 7)
            (func (export "g2") (result i32) i32.const 8))
        "#,
    );
    assert!(module.export("f").is_some());
    assert!(module.export("g2").is_some());
    // Memory and global exports are logged and dropped.
    assert!(module.export("memory").is_none());
    assert!(module.export("g").is_none());
    assert_eq!(module.exports().count(), 2);
}

#[test]
fn function_signatures_are_queryable() {
    let (module, _) = load(
        r#"
        (module (func (export "f") (param i32 i64) (result f64)
            f64.const 0))
        "#,
    );
    let index = module.export("f").unwrap();
    let ty = module.func_type_of(index).unwrap();
    assert_eq!(ty.params(), &[ValueType::I32, ValueType::I64]);
    assert_eq!(ty.results(), &[ValueType::F64]);
}

#[test]
fn unresolved_imports_fail_the_load() {
    let wasm = compile(
        r#"
        (module (import "env" "missing" (func)))
        "#,
    );
    let mut inst = Instance::new();
    let err = Module::load(&wasm, &Imports::new(), &mut inst).unwrap_err();
    assert_matches!(err.kind(), TrapCode::ImportNotFound);
    assert!(inst.exception().contains("env/missing"));
}

#[test]
fn name_section_attaches_function_names() {
    // One () -> () function plus a custom "name" section calling it
    // "alpha"; assemblers drop identifiers, so this is hand-encoded.
    let bytes = [
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // types: () -> ()
        0x03, 0x02, 0x01, 0x00, // funcs: one of type 0
        0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b, // code: empty body
        0x00, 0x0f, // custom section, 15 bytes
        0x04, b'n', b'a', b'm', b'e', // "name"
        0x01, 0x08, // function-name subsection, 8 bytes
        0x01, 0x00, 0x05, b'a', b'l', b'p', b'h', b'a', // 0 -> "alpha"
    ];
    let (module, _) = load_bytes(&bytes).expect("module loads");
    assert_eq!(module.func_name(0), Some("alpha"));
    assert_eq!(module.func_name(1), None);
}

#[test]
fn element_segments_populate_the_table() {
    let (module, mut inst) = load(
        r#"
        (module
            (type $v (func (result i32)))
            (table 4 funcref)
            (elem (i32.const 2) $f)
            (func $f (type $v) i32.const 41)
            (func (export "go") (result i32)
                i32.const 2
                call_indirect (type $v)))
        "#,
    );
    run(&module, &mut inst, "go").unwrap();
    assert_eq!(inst.pop_value(ValueType::I32), Value::I32(41));
}

#[test]
fn out_of_range_data_segment_fails_instantiation() {
    let wasm = compile(
        r#"
        (module (memory 1) (data (i32.const 0x20000) "x"))
        "#,
    );
    let err = load_bytes(&wasm).unwrap_err();
    assert_matches!(err.kind(), TrapCode::MemoryOutOfRange);
}

#[test]
fn saturating_truncation_is_rejected_not_skipped() {
    let (module, mut inst) = load(
        r#"
        (module (func (export "sat") (param f32) (result i32)
            local.get 0
            i32.trunc_sat_f32_s))
        "#,
    );
    inst.push_value(Value::F32(1.0));
    let trap = run(&module, &mut inst, "sat").unwrap_err();
    assert_matches!(trap.kind(), TrapCode::SaturatingTruncationNotSupported);
}

#[test]
fn multiple_instances_share_one_module() {
    let wasm = compile(
        r#"
        (module
            (global $g (mut i32) (i32.const 10))
            (func (export "bump") (result i32)
                global.get $g
                i32.const 1
                i32.add
                global.set $g
                global.get $g))
        "#,
    );
    let mut first = Instance::new();
    let module = Module::load(&wasm, &Imports::new(), &mut first).unwrap();
    module.instantiate(&mut first).unwrap();
    let mut second = Instance::new();
    module.instantiate(&mut second).unwrap();

    run(&module, &mut first, "bump").unwrap();
    run(&module, &mut first, "bump").unwrap();
    run(&module, &mut second, "bump").unwrap();
    assert_eq!(first.pop_value(ValueType::I32), Value::I32(12));
    assert_eq!(second.pop_value(ValueType::I32), Value::I32(11));
}
