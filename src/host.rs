//! Registration surface for host functions a guest may import.
//!
//! The host registers named callbacks keyed `"module/field"` before decoding
//! a module; function imports are resolved against this registry at decode
//! time. A callback sees the calling [`Instance`]: it pops its parameters in
//! reverse order, pushes its results, translates guest addresses, and
//! signals a trap by setting the exception string.
//!
//! [`Instance`]: crate::Instance

use crate::instance::Instance;
use crate::{Trap, TrapCode};
use std::collections::HashMap;
use std::rc::Rc;

/// Shared handle to a registered host function.
pub type HostFuncRef = Rc<dyn Fn(&mut Instance)>;

/// Import keys (and export names) are capped; longer names are rejected at
/// registration and at decode.
pub const MAX_NAME_LEN: usize = 64;

/// Named host functions available for import.
#[derive(Default)]
pub struct Imports {
    funcs: HashMap<String, HostFuncRef>,
}

impl Imports {
    pub fn new() -> Imports {
        Imports::default()
    }

    /// Register `func` under `"module/field"`.
    pub fn register<F>(&mut self, name: &str, func: F) -> Result<(), Trap>
    where
        F: Fn(&mut Instance) + 'static,
    {
        if name.len() > MAX_NAME_LEN {
            return Err(Trap::new(TrapCode::NameTooLong));
        }
        self.funcs.insert(name.to_string(), Rc::new(func));
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<HostFuncRef> {
        self.funcs.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn register_and_find() {
        let mut imports = Imports::new();
        imports.register("env/nop", |_| {}).unwrap();
        assert!(imports.find("env/nop").is_some());
        assert!(imports.find("env/other").is_none());
    }

    #[test]
    fn oversized_names_are_rejected() {
        let mut imports = Imports::new();
        let name = "m/".to_string() + &"x".repeat(MAX_NAME_LEN);
        let err = imports.register(&name, |_| {}).unwrap_err();
        assert_matches!(err.kind(), TrapCode::NameTooLong);
    }
}
