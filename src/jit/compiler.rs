//! JIT compiler for sumatra functions.
//!
//! Drives the backend in two phases. First every function is generated and
//! a code region is reserved for it, which fixes its entry point; function
//! bodies may call each other mutually, so no call site can be finalized
//! before this phase completes. Then `make_executable` patches every
//! recorded call site in the in-buffer code, copies each buffer into its
//! reserved region, and flips all regions executable as one batch. Nothing
//! runs before that transition and nothing is written after it.

use super::JitError;
use super::codegen::{
    AddressMode, CodeGenerator, CompilationData, MOV_IMM64_OFFSET, NEAR_CALL_LEN,
};
use super::memory::ExecutableMemoryManager;
use crate::vm::{FunctionId, Module};

enum PatchValue {
    U32(u32),
    U64(u64),
}

/// Compiles functions to native code and owns the resulting code memory.
pub struct JitCompiler {
    memory: ExecutableMemoryManager,
    compilations: Vec<CompilationData>,
    finalized: bool,
}

impl JitCompiler {
    pub fn new() -> Self {
        Self {
            memory: ExecutableMemoryManager::new(),
            compilations: Vec::new(),
            finalized: false,
        }
    }

    /// Compile a function: generate its code, reserve a region sized to the
    /// generated bytes and record the region base as the function's entry
    /// point. Returns the entry point.
    ///
    /// The region is not populated here; later functions may already encode
    /// calls against the address while this function's call sites are still
    /// unresolved.
    pub fn compile(&mut self, module: &mut Module, id: FunctionId) -> Result<*const u8, JitError> {
        let (buf, data) = CodeGenerator::generate(module, id)?;
        let size = buf.len();
        let base = self.memory.allocate(size)?;

        let func = module.function_mut(id);
        func.install_code(buf);
        func.set_entry_point(base as usize);

        log::debug!(
            "compiled `{}`: {} bytes at {:p}, {} unresolved calls",
            func.definition().name(),
            size,
            base,
            data.unresolved_calls.len()
        );

        self.compilations.push(data);
        Ok(base as *const u8)
    }

    /// Patch every recorded call site of one compilation against the now
    /// known entry points, then forget the call list so a second resolution
    /// pass cannot patch twice.
    fn resolve_call_targets(
        module: &mut Module,
        data: &mut CompilationData,
    ) -> Result<(), JitError> {
        if data.unresolved_calls.is_empty() {
            return Ok(());
        }

        let own = module.function(data.function);
        let own_entry = own
            .definition()
            .entry_point()
            .ok_or_else(|| JitError::UnresolvableCallTarget(own.definition().name().to_string()))?;

        let mut patches = Vec::with_capacity(data.unresolved_calls.len());
        for call in &data.unresolved_calls {
            let target = module.function(call.target).definition();
            let entry = target
                .entry_point()
                .ok_or_else(|| JitError::UnresolvableCallTarget(target.name().to_string()))?;

            match call.mode {
                AddressMode::Absolute => {
                    patches.push((call.offset + MOV_IMM64_OFFSET, PatchValue::U64(entry as u64)));
                }
                AddressMode::Relative => {
                    let disp =
                        entry as i64 - (own_entry as i64 + call.offset as i64 + NEAR_CALL_LEN as i64);
                    let disp = i32::try_from(disp).map_err(|_| {
                        JitError::CallDisplacementOverflow(target.name().to_string())
                    })?;
                    patches.push((call.offset + 1, PatchValue::U32(disp as u32)));
                }
            }
        }

        let buf = module.function_mut(data.function).generated_code_mut();
        for (offset, value) in patches {
            match value {
                PatchValue::U32(v) => buf.patch_u32(offset, v),
                PatchValue::U64(v) => buf.patch_u64(offset, v),
            }
        }
        data.unresolved_calls.clear();
        Ok(())
    }

    /// Resolve the call targets of every compiled function and copy each
    /// function's final code into its reserved region.
    ///
    /// Per function the order is patch-then-copy; across functions the
    /// order does not matter because every entry point was fixed during
    /// compilation. The call lists are cleared on first resolution, so
    /// running this again re-copies identical bytes and patches nothing.
    pub fn resolve_symbols(&mut self, module: &mut Module) -> Result<(), JitError> {
        for data in &mut self.compilations {
            Self::resolve_call_targets(module, data)?;

            let func = module.function(data.function);
            let entry = func.definition().entry_point().ok_or_else(|| {
                JitError::UnresolvableCallTarget(func.definition().name().to_string())
            })?;
            self.memory
                .write(entry as *const u8, func.generated_code().code())?;
        }
        log::debug!("resolved symbols for {} functions", self.compilations.len());
        Ok(())
    }

    /// Resolve all symbols and mark all reserved regions executable as one
    /// batch. Idempotent. On any error nothing becomes executable.
    pub fn make_executable(&mut self, module: &mut Module) -> Result<(), JitError> {
        if self.finalized {
            return Ok(());
        }
        self.resolve_symbols(module)?;
        self.memory.make_executable()?;
        self.finalized = true;
        Ok(())
    }

    /// Whether `make_executable` has completed.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Get a function's entry point as a typed function pointer.
    ///
    /// Returns `None` until `make_executable` has completed, or if `F` is
    /// not a function-pointer-sized type.
    ///
    /// # Safety
    /// The caller must ensure that `F` matches the calling convention and
    /// signature of the compiled function.
    pub unsafe fn function_pointer<F>(&self, module: &Module, id: FunctionId) -> Option<F>
    where
        F: Copy,
    {
        if !self.finalized {
            return None;
        }
        let entry = module.function(id).definition().entry_point()?;
        if std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }

        // SAFETY: the entry point addresses executable memory holding the
        // function's code; the caller guarantees the signature
        Some(unsafe { std::mem::transmute_copy(&entry) })
    }
}

impl Default for JitCompiler {
    fn default() -> Self {
        Self::new()
    }
}
