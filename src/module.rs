//! Decoding of the binary module format into an immutable program image.
//!
//! A [`Module`] is parsed once and never mutated afterwards; any number of
//! [`Instance`]s can run it in turn. Decoding walks the sections twice:
//! [`Module::load`] consumes everything that belongs to the program (types,
//! imports, functions, table, exports, start, elements, code), and
//! [`Module::instantiate`] replays the per-instance sections (memory
//! limits, globals, data segments) into a fresh instance, running the
//! initialiser expressions on the instance's own interpreter.

use crate::func::{FuncBody, Functions};
use crate::host::{Imports, MAX_NAME_LEN};
use crate::instance::Instance;
use crate::isa;
use crate::leb::ByteReader;
use crate::memory::MAX_PAGES;
use crate::runner::run_init_expr;
use crate::types::{
    inline_block_type, type_code, ExternalKind, FuncType, ValueType, MAX_PARAMS, MAX_RESULTS,
};
use crate::{Trap, TrapCode};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const WASM_MAGIC: u32 = 0x6d73_6100;
const WASM_VERSION: u32 = 0x01;

/// Deserialised module, immutable after [`Module::load`].
#[derive(Debug)]
pub struct Module {
    pub(crate) bytecode: Vec<u8>,
    types: Vec<FuncType>,
    pub(crate) funcs: Functions,
    exports: HashMap<String, u32>,
    start_function: Option<u32>,
    pub(crate) table: Vec<u64>,
    func_names: HashMap<u32, String>,
}

/// Per-section lists are bounded relative to the module size; a tiny module
/// declaring millions of entries is rejected before any allocation.
fn entry_cap(byte_count: usize) -> usize {
    16 + byte_count / 16
}

impl Module {
    /// Decode the program sections of `wasm`, resolving function imports
    /// against `imports`. `d` provides the execution context for element
    /// offset expressions and receives exception text on failure.
    pub fn load(wasm: &[u8], imports: &Imports, d: &mut Instance) -> Result<Module, Trap> {
        let mut module = Module {
            bytecode: wasm.to_vec(),
            types: Vec::new(),
            funcs: Functions::default(),
            exports: HashMap::new(),
            start_function: None,
            table: Vec::new(),
            func_names: HashMap::new(),
        };
        let cap = entry_cap(wasm.len());
        let mut r = ByteReader::new(wasm);

        let magic = r.read_u32_le();
        if magic != WASM_MAGIC {
            return Err(d.trap(TrapCode::BadMagic, &format!("not wasm {:#010x}", magic)));
        }
        let version = r.read_u32_le();
        if version != WASM_VERSION {
            return Err(d.trap(
                TrapCode::UnsupportedVersion,
                &format!("unsupported version {:#010x}", version),
            ));
        }

        while r.pos < r.len() {
            let section_id = r.read_var_u(7) as u8;
            let section_len = r.read_var_u32() as usize;
            let section_begin = r.pos;
            debug!(section_id, section_len, pos = section_begin, "program section");
            match section_id {
                0 => {
                    module.parse_custom_section(wasm, section_begin, section_len);
                    r.pos = section_begin.saturating_add(section_len).min(wasm.len());
                    if section_begin + section_len > wasm.len() {
                        return Err(d.trap(TrapCode::TruncatedModule, "custom section overruns"));
                    }
                }
                1 => module.parse_type_section(&mut r, cap, d)?,
                2 => module.parse_import_section(&mut r, cap, imports, d)?,
                3 => module.parse_function_section(&mut r, cap, d)?,
                4 => module.parse_table_section(&mut r, cap, d)?,
                // Memory, globals and data belong to the instance.
                5 | 6 | 11 | 12 => r.skip(section_len),
                7 => module.parse_export_section(&mut r, cap, d)?,
                8 => module.start_function = Some(r.read_var_u32()),
                9 => module.parse_element_section(&mut r, cap, d)?,
                10 => module.parse_code_section(&mut r, cap, wasm, d)?,
                _ => {
                    return Err(d.trap(
                        TrapCode::UnknownSection,
                        &format!("section {} unimplemented", section_id),
                    ))
                }
            }
            if r.pos != section_begin + section_len {
                return Err(d.trap(
                    TrapCode::MisalignedSection,
                    &format!(
                        "section {} did not add up, {} + {} != {}",
                        section_id, section_begin, section_len, r.pos
                    ),
                ));
            }
        }
        if r.overrun() {
            return Err(d.trap(TrapCode::TruncatedModule, "leb128 decoding failed"));
        }
        Ok(module)
    }

    /// The `name` custom subsection attaches function names used in logs
    /// and reports. Malformed content is ignored, never fatal.
    fn parse_custom_section(&mut self, wasm: &[u8], begin: usize, len: usize) {
        let mut r = ByteReader::at(wasm, begin);
        let section_end = begin + len;
        match r.read_name() {
            Some(b"name") => {}
            _ => return,
        }
        while r.pos < section_end && !r.overrun() {
            let subsection_id = r.read_u8();
            let subsection_len = r.read_var_u32() as usize;
            let subsection_end = r.pos + subsection_len;
            if subsection_id == 1 {
                let count = r.read_var_u32();
                for _ in 0..count {
                    if r.overrun() || r.pos >= subsection_end {
                        break;
                    }
                    let func_index = r.read_var_u32();
                    if let Some(name) = r.read_name() {
                        let mut name = String::from_utf8_lossy(name).into_owned();
                        name.truncate(MAX_NAME_LEN);
                        debug!(func_index, name = name.as_str(), "function name");
                        self.func_names.insert(func_index, name);
                    }
                }
            }
            r.pos = subsection_end;
        }
    }

    fn parse_type_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        if !self.types.is_empty() {
            return Err(d.trap(TrapCode::DuplicateSection, "second type section"));
        }
        let count = r.read_var_u32() as usize;
        if count > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many function types"));
        }
        for i in 0..count {
            let shape = r.read_u8();
            if shape != type_code::FUNC {
                warn!(shape, "type does not start with the function type code");
            }
            let param_count = r.read_var_u32() as usize;
            if param_count > MAX_PARAMS {
                return Err(d.trap(
                    TrapCode::TooManyParameters,
                    &format!("too many parameters {}", param_count),
                ));
            }
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                params.push(read_value_type(r, d)?);
            }
            let result_count = r.read_var_u32() as usize;
            if result_count > MAX_RESULTS {
                return Err(d.trap(
                    TrapCode::TooManyResults,
                    &format!("too many results {}", result_count),
                ));
            }
            let mut results = Vec::with_capacity(result_count);
            for _ in 0..result_count {
                results.push(read_value_type(r, d)?);
            }
            let ty = FuncType::new(params, results);
            debug!(index = i, %ty, "type");
            self.types.push(ty);
        }
        Ok(())
    }

    fn parse_import_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        imports: &Imports,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        if self.funcs.len() != 0 {
            return Err(d.trap(TrapCode::DuplicateSection, "second import section"));
        }
        let count = r.read_var_u32() as usize;
        if count > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many imports"));
        }
        for _ in 0..count {
            let module_name = read_name_or_trap(r, d)?;
            let field_name = read_name_or_trap(r, d)?;
            let kind = r.read_u8();
            match ExternalKind::from_code(kind) {
                Some(ExternalKind::Func) => {
                    if module_name.len() + 1 + field_name.len() > MAX_NAME_LEN {
                        return Err(d.trap(
                            TrapCode::NameTooLong,
                            &format!("name too long '{}'", field_name),
                        ));
                    }
                    let key = format!("{}/{}", module_name, field_name);
                    let type_index = r.read_var_u32();
                    match imports.find(&key) {
                        Some(host) => {
                            info!(
                                index = self.funcs.imported_count(),
                                name = key.as_str(),
                                "import"
                            );
                            self.funcs.push_imported(type_index, host);
                        }
                        None => {
                            return Err(d.trap(
                                TrapCode::ImportNotFound,
                                &format!("did not find '{}'", key),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(d.trap(
                        TrapCode::UnsupportedImportKind,
                        &format!(
                            "importing {}, not yet supported '{}' '{}'",
                            kind, module_name, field_name
                        ),
                    ))
                }
            }
        }
        Ok(())
    }

    fn parse_function_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        if self.funcs.len() != self.funcs.imported_count() {
            return Err(d.trap(TrapCode::DuplicateSection, "second function section"));
        }
        let count = r.read_var_u32() as usize;
        if self.funcs.len() as usize + count > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many functions"));
        }
        for _ in 0..count {
            let type_index = r.read_var_u32();
            self.funcs.push_internal(type_index);
        }
        Ok(())
    }

    fn parse_table_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        let table_count = r.read_var_u32();
        if !self.table.is_empty() || table_count != 1 {
            return Err(d.trap(
                TrapCode::OnlyOneTableAllowed,
                "only one table is supported",
            ));
        }
        let element_type = r.read_var_u(33) as u8;
        if element_type != type_code::FUNCREF {
            return Err(d.trap(
                TrapCode::UnsupportedTableType,
                &format!("table element type {:#x}", element_type),
            ));
        }
        let flags = r.read_var_u32();
        let initial = r.read_var_u32() as usize;
        if initial > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many table elements"));
        }
        self.table = vec![0; initial];
        if flags & 0x1 != 0 {
            let _maximum = r.read_var_u32();
        }
        Ok(())
    }

    fn parse_export_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        let count = r.read_var_u32() as usize;
        if count > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many exports"));
        }
        for _ in 0..count {
            let name = read_name_or_trap(r, d)?;
            let kind = r.read_u8();
            let index = r.read_var_u32();
            if name.len() > MAX_NAME_LEN {
                return Err(d.trap(
                    TrapCode::NameTooLong,
                    &format!("name too long '{}'", name),
                ));
            }
            match ExternalKind::from_code(kind) {
                Some(ExternalKind::Func) => {
                    if self.funcs.get(index).is_none() {
                        return Err(d.trap(
                            TrapCode::FuncIndexOutOfRange,
                            &format!("export '{}' of function {}", name, index),
                        ));
                    }
                    info!(index, name = name.as_str(), "exported function");
                    self.exports.insert(name, index);
                }
                Some(ExternalKind::Table) => {
                    info!(index, name = name.as_str(), "ignored export of table")
                }
                Some(ExternalKind::Memory) => {
                    info!(index, name = name.as_str(), "ignored export of memory")
                }
                Some(ExternalKind::Global) => {
                    info!(index, name = name.as_str(), "ignored export of global")
                }
                None => {
                    return Err(d.trap(
                        TrapCode::UnsupportedExportKind,
                        &format!("unknown export type {} for '{}'", kind, name),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Element segments populate the function table. Offsets come from
    /// initialiser expressions, so they run on the instance's interpreter
    /// against the partially built module.
    fn parse_element_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        d: &mut Instance,
    ) -> Result<(), Trap> {
        let count = r.read_var_u32() as usize;
        if count > cap {
            return Err(d.trap(TrapCode::TooManyEntries, "too many element segments"));
        }
        for _ in 0..count {
            let table_index = r.read_var_u32();
            if table_index != 0 {
                return Err(d.trap(
                    TrapCode::OnlyOneTableAllowed,
                    "only one table is supported",
                ));
            }
            d.pc = r.pos;
            run_init_expr(self, d, ValueType::I32)?;
            r.pos = d.pc;
            let offset = u32::from(d.pop()) as usize;

            let entry_count = r.read_var_u32() as usize;
            if entry_count > cap {
                return Err(d.trap(TrapCode::TooManyEntries, "too many table entries"));
            }
            if self.table.len() < offset + entry_count {
                self.table.resize(offset + entry_count, 0);
            }
            for slot in 0..entry_count {
                self.table[offset + slot] = r.read_var_u(64);
            }
        }
        Ok(())
    }

    fn parse_code_section(
        &mut self,
        r: &mut ByteReader,
        cap: usize,
        wasm: &[u8],
        d: &mut Instance,
    ) -> Result<(), Trap> {
        let count = r.read_var_u32() as usize;
        let imported = self.funcs.imported_count();
        if imported as usize + count > self.funcs.len() as usize {
            return Err(d.trap(
                TrapCode::TooManyEntries,
                &format!(
                    "too many code entries, {} {} {}",
                    count,
                    imported,
                    self.funcs.len()
                ),
            ));
        }
        for i in 0..count {
            let body_len = r.read_var_u32() as usize;
            let body_begin = r.pos;

            // Local declarations, run-length encoded.
            let declaration_count = r.read_var_u32() as usize;
            if declaration_count > cap {
                return Err(d.trap(TrapCode::TooManyEntries, "too many local declarations"));
            }
            let mut locals: u32 = 0;
            for _ in 0..declaration_count {
                let run = r.read_var_u32();
                locals = locals.saturating_add(run);
                let code = r.read_var_u(7) as u8;
                match code {
                    type_code::I32
                    | type_code::I64
                    | type_code::F32
                    | type_code::F64
                    | type_code::FUNC
                    | type_code::FUNCREF
                    | type_code::EXTERNREF => {}
                    _ => {
                        return Err(d.trap(
                            TrapCode::VectorsNotSupported,
                            &format!("local of type {:#x}", code),
                        ))
                    }
                }
            }
            // Slack slots; some toolchains address a few locals past the
            // declared count.
            locals += 10;

            if body_len == 0 || body_begin + body_len > wasm.len() {
                return Err(d.trap(TrapCode::TruncatedModule, "code entry overruns"));
            }
            let start = r.pos;
            let end = body_begin + body_len - 1;
            if wasm[end] != isa::END {
                return Err(d.trap(
                    TrapCode::MissingEndOpcode,
                    &format!("missing end opcode at {:#x}", end),
                ));
            }
            let func = self
                .funcs
                .get_mut(imported + i as u32)
                .expect("counted against funcs.len above");
            func.body = FuncBody::Internal { start, end, locals };
            r.pos = end + 1;
        }
        Ok(())
    }

    /// Replay the per-instance sections into `d`: memory limits, globals,
    /// data segments. Leaves the start function's first frame set up when
    /// the module declares one.
    pub fn instantiate(&self, d: &mut Instance) -> Result<(), Trap> {
        let bytes: &[u8] = &self.bytecode;
        let cap = entry_cap(bytes.len());
        let mut r = ByteReader::at(bytes, 8);
        let mut memory_seen = false;

        while r.pos < bytes.len() {
            let section_id = r.read_var_u(7) as u8;
            let section_len = r.read_var_u32() as usize;
            let section_begin = r.pos;
            debug!(section_id, section_len, "instance section");
            match section_id {
                5 => {
                    let memory_count = r.read_var_u32();
                    if memory_count != 1 || memory_seen {
                        return Err(d.trap(
                            TrapCode::OnlyOneMemoryAllowed,
                            "only one memory is supported",
                        ));
                    }
                    memory_seen = true;
                    let flags = r.read_var_u32();
                    let initial = r.read_var_u32();
                    let maximum = if flags & 0x1 != 0 {
                        let maximum = r.read_var_u32();
                        if maximum > MAX_PAGES {
                            return Err(d.trap(
                                TrapCode::TooMuchMemoryRequested,
                                &format!("{:#x}", maximum),
                            ));
                        }
                        maximum
                    } else {
                        MAX_PAGES
                    };
                    if initial > maximum {
                        return Err(d.trap(
                            TrapCode::InvalidMemoryLimits,
                            &format!("initial {} pages above maximum {}", initial, maximum),
                        ));
                    }
                    debug!(initial, maximum, "memory limits");
                    d.memory.set_limits(initial, maximum);
                }
                6 => {
                    let count = r.read_var_u32() as usize;
                    if count > cap {
                        return Err(d.trap(TrapCode::TooManyEntries, "too many globals"));
                    }
                    for i in 0..count {
                        let ty = read_value_type(&mut r, d)?;
                        let _mutable = r.read_var_u(1);
                        d.pc = r.pos;
                        run_init_expr(self, d, ty)?;
                        r.pos = d.pc;
                        let value = d.pop();
                        debug!(index = i, value = value.0, "global");
                        d.globals.push(value.0);
                    }
                    r.pos = section_begin + section_len;
                }
                11 => {
                    let count = r.read_var_u32() as usize;
                    if count > cap {
                        return Err(d.trap(TrapCode::TooManyEntries, "too many data segments"));
                    }
                    for _ in 0..count {
                        let memory_index = r.read_var_u32();
                        if memory_index != 0 {
                            return Err(d.trap(
                                TrapCode::OnlyOneMemoryAllowed,
                                "only one memory is supported",
                            ));
                        }
                        d.pc = r.pos;
                        run_init_expr(self, d, ValueType::I32)?;
                        r.pos = d.pc;
                        let offset = u32::from(d.pop());
                        let size = r.read_var_u32() as usize;
                        if offset as usize + size > d.memory.byte_size() {
                            return Err(d.trap(
                                TrapCode::MemoryOutOfRange,
                                &format!("data segment {:#x} {:#x}", offset, size),
                            ));
                        }
                        let source = match bytes.get(r.pos..r.pos + size) {
                            Some(source) => source,
                            None => {
                                return Err(
                                    d.trap(TrapCode::TruncatedModule, "data segment overruns")
                                )
                            }
                        };
                        match d.memory.translate(offset, size) {
                            Some(target) => target.copy_from_slice(source),
                            None => {
                                return Err(d.trap(
                                    TrapCode::MemoryOutOfRange,
                                    &format!("data segment {:#x} {:#x}", offset, size),
                                ))
                            }
                        }
                        r.pos += size;
                    }
                }
                _ => r.skip(section_len),
            }
            if r.pos != section_begin + section_len {
                return Err(d.trap(TrapCode::MisalignedSection, "data section did not add up"));
            }
        }
        if r.overrun() {
            return Err(d.trap(TrapCode::TruncatedModule, "leb128 decoding failed"));
        }

        // The start function runs when the host first ticks; only its frame
        // is set up here.
        if let Some(start) = self.start_function {
            if start < self.funcs.imported_count() {
                return Err(d.trap(
                    TrapCode::StartFunctionImported,
                    &format!("cannot use imported function {} as start", start),
                ));
            }
            self.setup_call(d, start)?;
        }
        Ok(())
    }

    // -- lookups ----------------------------------------------------------

    /// Index of the exported function `name`.
    pub fn export(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }

    /// All exported functions, in no particular order.
    pub fn exports(&self) -> impl Iterator<Item = (&str, u32)> {
        self.exports.iter().map(|(name, idx)| (name.as_str(), *idx))
    }

    /// Signature of function `func_index`.
    pub fn func_type_of(&self, func_index: u32) -> Option<&FuncType> {
        let func = self.funcs.get(func_index)?;
        self.types.get(func.type_index as usize)
    }

    /// Signature for a block-type index: non-negative indexes the type
    /// section, negative selects an inline block signature.
    pub(crate) fn func_type_by_index(&self, index: i64) -> Option<&FuncType> {
        if index >= 0 {
            self.types.get(index as usize)
        } else {
            inline_block_type(index)
        }
    }

    /// Name attached by the custom `name` section, if any.
    pub fn func_name(&self, func_index: u32) -> Option<&str> {
        self.func_names.get(&func_index).map(String::as_str)
    }

    pub fn func_count(&self) -> u32 {
        self.funcs.len()
    }

    pub fn imported_count(&self) -> u32 {
        self.funcs.imported_count()
    }

    /// Byte offsets `[start, end]` of an internal function's body; the byte
    /// at `end` is the `end` opcode.
    pub fn code_range(&self, func_index: u32) -> Option<(usize, usize)> {
        match self.funcs.get(func_index)?.body {
            FuncBody::Internal { start, end, .. } => Some((start, end)),
            FuncBody::Imported { .. } => None,
        }
    }

    pub fn start_function(&self) -> Option<u32> {
        self.start_function
    }

    /// Size of the module binary held by this image.
    pub fn byte_len(&self) -> usize {
        self.bytecode.len()
    }

    /// The module binary this image was decoded from.
    pub fn bytes(&self) -> &[u8] {
        &self.bytecode
    }
}

fn read_value_type(r: &mut ByteReader, d: &mut Instance) -> Result<ValueType, Trap> {
    let code = r.read_var_u32() as u8;
    ValueType::from_code(code).ok_or_else(|| {
        d.trap(
            TrapCode::UnsupportedValueType,
            &format!("value type {:#x}", code),
        )
    })
}

fn read_name_or_trap(r: &mut ByteReader, d: &mut Instance) -> Result<String, Trap> {
    match r.read_name() {
        Some(name) => Ok(String::from_utf8_lossy(name).into_owned()),
        None => Err(d.trap(TrapCode::TruncatedModule, "name overruns module")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const EMPTY_MODULE: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn load(bytes: &[u8]) -> Result<Module, Trap> {
        let mut inst = Instance::new();
        Module::load(bytes, &Imports::new(), &mut inst)
    }

    #[test]
    fn minimal_module_loads() {
        let module = load(EMPTY_MODULE).unwrap();
        assert_eq!(module.func_count(), 0);
        assert!(module.start_function().is_none());
    }

    #[test]
    fn bad_magic_and_version_have_distinct_codes() {
        let err = load(&[0x00, 0x61, 0x73, 0x00, 0x01, 0x00, 0x00, 0x00]).unwrap_err();
        assert_matches!(err.kind(), TrapCode::BadMagic);
        let err = load(&[0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00]).unwrap_err();
        assert_matches!(err.kind(), TrapCode::UnsupportedVersion);
    }

    #[test]
    fn misaligned_section_is_rejected() {
        // Type section claiming 3 bytes but containing a single zero count.
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0x01, 0x03, 0x00, 0x60, 0x00]);
        let err = load(&bytes).unwrap_err();
        assert_matches!(err.kind(), TrapCode::MisalignedSection);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0x2a, 0x00]);
        let err = load(&bytes).unwrap_err();
        assert_matches!(err.kind(), TrapCode::UnknownSection);
    }

    #[test]
    fn truncated_module_is_rejected() {
        // Type section whose length runs past the end of the module.
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0x01, 0x7f]);
        let err = load(&bytes).unwrap_err();
        assert_matches!(
            err.kind(),
            TrapCode::TruncatedModule | TrapCode::MisalignedSection
        );
    }
}
