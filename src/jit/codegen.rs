//! Code generation for sumatra functions.
//!
//! Walks a function's IR and emits x86-64 machine code into a fresh code
//! buffer, pushing and popping operands through frame slots. Calls to other
//! functions are emitted with placeholder targets and recorded as
//! `UnresolvedFunctionCall`s; the compiler patches them once every
//! function's entry point is known.

use super::JitError;
use super::codebuf::CodeBuffer;
use super::operand_stack::{OperandStack, REGISTER_SIZE};
use super::x86_64::{Assembler, ExtReg, FloatReg, Reg, Register};
use crate::vm::{Function, FunctionId, Module, Op};

/// Length of a near call (one opcode byte plus a 4-byte displacement).
/// Relative fixups subtract it; it must match the form `emit_call` emits.
pub(super) const NEAR_CALL_LEN: usize = 5;

/// Offset of the immediate within `mov r64, imm64` (REX.W + opcode).
/// Absolute fixups write the target address there.
pub(super) const MOV_IMM64_OFFSET: usize = 2;

/// Integer argument registers in System V AMD64 order.
const ARG_REGISTERS: [Register; 6] = [
    Register::Gp(Reg::Rdi),
    Register::Gp(Reg::Rsi),
    Register::Gp(Reg::Rdx),
    Register::Gp(Reg::Rcx),
    Register::Ext(ExtReg::R8),
    Register::Ext(ExtReg::R9),
];

/// How a call site encodes its target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `mov rax, imm64; call rax`; the 8-byte address is patched in.
    Absolute,
    /// `call rel32`; a 4-byte displacement from the end of the call.
    Relative,
}

/// A call whose encoded target is still a placeholder.
#[derive(Debug, Clone)]
pub struct UnresolvedFunctionCall {
    pub target: FunctionId,
    /// Byte offset of the call site within the function's generated code.
    pub offset: usize,
    pub mode: AddressMode,
}

/// Per-function compilation context, retained until call resolution.
#[derive(Debug)]
pub struct CompilationData {
    pub function: FunctionId,
    pub operand_stack: OperandStack,
    pub unresolved_calls: Vec<UnresolvedFunctionCall>,
}

/// Generates the instruction stream for one function.
pub struct CodeGenerator<'a> {
    module: &'a Module,
    func: &'a Function,
    id: FunctionId,
    buf: CodeBuffer,
    stack: OperandStack,
    calls: Vec<UnresolvedFunctionCall>,
}

impl<'a> CodeGenerator<'a> {
    /// Compile the body of `id` and return the generated code together with
    /// the compilation context for later call resolution.
    pub fn generate(
        module: &'a Module,
        id: FunctionId,
    ) -> Result<(CodeBuffer, CompilationData), JitError> {
        let func = module.function(id);
        let generator = CodeGenerator {
            module,
            func,
            id,
            buf: CodeBuffer::new(),
            stack: OperandStack::new(func.definition().num_params(), func.num_locals()),
            calls: Vec::new(),
        };
        generator.run()
    }

    fn run(mut self) -> Result<(CodeBuffer, CompilationData), JitError> {
        let name = self.func.definition().name();
        let num_params = self.func.definition().num_params();
        if num_params > ARG_REGISTERS.len() {
            return Err(JitError::TooManyParameters(name.to_string(), num_params));
        }
        if !matches!(self.func.code().last(), Some(Op::Ret)) {
            return Err(JitError::MissingReturn(name.to_string()));
        }

        log::trace!("generating `{}`: {} ops", name, self.func.code().len());

        self.emit_prologue();
        for op in self.func.code() {
            self.emit_op(op)?;
        }

        Ok((
            self.buf,
            CompilationData {
                function: self.id,
                operand_stack: self.stack,
                unresolved_calls: self.calls,
            },
        ))
    }

    fn num_params(&self) -> usize {
        self.func.definition().num_params()
    }

    /// Frame offset of parameter `i` (closest region below RBP).
    fn arg_offset(&self, index: usize) -> i32 {
        -((REGISTER_SIZE * (1 + index)) as i32)
    }

    /// Frame offset of local `j` (between parameters and operand slots).
    fn local_offset(&self, index: usize) -> i32 {
        -((REGISTER_SIZE * (1 + self.num_params() + index)) as i32)
    }

    /// Emit function prologue: establish the frame, reserve space for
    /// parameters, locals and the deepest operand stack the body reaches,
    /// spill argument registers into their slots and zero the locals.
    fn emit_prologue(&mut self) {
        let num_params = self.num_params();
        let num_locals = self.func.num_locals();
        let depth = max_operand_depth(self.module, self.func);

        // Keep RSP 16-byte aligned at call sites
        let frame_size = (REGISTER_SIZE * (num_params + num_locals + depth) + 15) & !15;

        let mut asm = Assembler::new(&mut self.buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if frame_size > 0 {
            asm.sub_ri32(Reg::Rsp, frame_size as i32);
        }

        for i in 0..num_params {
            let offset = -((REGISTER_SIZE * (1 + i)) as i32);
            asm.store_frame(offset, ARG_REGISTERS[i]);
        }
        for j in 0..num_locals {
            let offset = -((REGISTER_SIZE * (1 + num_params + j)) as i32);
            asm.store_frame_imm32(offset, 0);
        }
    }

    fn emit_op(&mut self, op: &Op) -> Result<(), JitError> {
        match op {
            Op::PushInt(n) => {
                self.stack.push_int(&mut self.buf, *n);
                Ok(())
            }
            Op::PushFloat(f) => self.emit_push_float(*f),
            Op::Pop => {
                // Discard the top slot by popping it into a scratch register
                self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rax))
            }

            Op::Add | Op::Sub | Op::Mul => self.emit_int_binop(op),
            Op::Div => self.emit_div(),
            Op::AddFloat | Op::SubFloat | Op::MulFloat | Op::DivFloat => {
                self.emit_float_binop(op)
            }

            Op::LoadLocal(idx) => self.emit_load_local(*idx),
            Op::StoreLocal(idx) => self.emit_store_local(*idx),
            Op::LoadArg(idx) => self.emit_load_arg(*idx),

            Op::Call(target) => self.emit_call(*target),
            Op::Ret => self.emit_ret(),
        }
    }

    /// Push a float constant through its raw bit pattern.
    fn emit_push_float(&mut self, f: f64) -> Result<(), JitError> {
        Assembler::new(&mut self.buf).mov_ri64(Reg::Rax, f.to_bits() as i64);
        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    /// Integer binary operation: pop rhs into RCX, lhs into RAX, combine,
    /// push the result.
    fn emit_int_binop(&mut self, op: &Op) -> Result<(), JitError> {
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rcx))?;
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rax))?;
        {
            let mut asm = Assembler::new(&mut self.buf);
            match op {
                Op::Add => asm.add_rr(Reg::Rax, Reg::Rcx),
                Op::Sub => asm.sub_rr(Reg::Rax, Reg::Rcx),
                Op::Mul => asm.imul_rr(Reg::Rax, Reg::Rcx),
                _ => unreachable!("not an integer binop: {:?}", op),
            }
        }
        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    /// Signed integer division; quotient is pushed.
    fn emit_div(&mut self) -> Result<(), JitError> {
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rcx))?;
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rax))?;
        {
            let mut asm = Assembler::new(&mut self.buf);
            asm.cqo();
            asm.idiv(Reg::Rcx);
        }
        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    /// Float binary operation through XMM0/XMM1.
    fn emit_float_binop(&mut self, op: &Op) -> Result<(), JitError> {
        self.stack
            .pop_register(&mut self.buf, Register::Float(FloatReg::Xmm1))?;
        self.stack
            .pop_register(&mut self.buf, Register::Float(FloatReg::Xmm0))?;
        {
            let mut asm = Assembler::new(&mut self.buf);
            match op {
                Op::AddFloat => asm.addsd(FloatReg::Xmm0, FloatReg::Xmm1),
                Op::SubFloat => asm.subsd(FloatReg::Xmm0, FloatReg::Xmm1),
                Op::MulFloat => asm.mulsd(FloatReg::Xmm0, FloatReg::Xmm1),
                Op::DivFloat => asm.divsd(FloatReg::Xmm0, FloatReg::Xmm1),
                _ => unreachable!("not a float binop: {:?}", op),
            }
        }
        self.stack
            .push_register(&mut self.buf, Register::Float(FloatReg::Xmm0));
        Ok(())
    }

    fn emit_load_local(&mut self, idx: usize) -> Result<(), JitError> {
        if idx >= self.func.num_locals() {
            return Err(JitError::InvalidLocal(idx));
        }
        let offset = self.local_offset(idx);
        Assembler::new(&mut self.buf).load_frame(offset, Register::Gp(Reg::Rax));
        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    fn emit_store_local(&mut self, idx: usize) -> Result<(), JitError> {
        if idx >= self.func.num_locals() {
            return Err(JitError::InvalidLocal(idx));
        }
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rax))?;
        let offset = self.local_offset(idx);
        Assembler::new(&mut self.buf).store_frame(offset, Register::Gp(Reg::Rax));
        Ok(())
    }

    fn emit_load_arg(&mut self, idx: usize) -> Result<(), JitError> {
        if idx >= self.num_params() {
            return Err(JitError::InvalidArgument(idx));
        }
        let offset = self.arg_offset(idx);
        Assembler::new(&mut self.buf).load_frame(offset, Register::Gp(Reg::Rax));
        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    /// Emit a function call and record it for later resolution.
    ///
    /// Arguments are popped into the argument registers, last argument
    /// first. A target whose entry point is already reserved gets the
    /// 5-byte near-call form; a forward reference gets the absolute
    /// `mov rax, imm64; call rax` form. Either way the encoded target is a
    /// placeholder until `resolve_call_targets` patches it.
    fn emit_call(&mut self, target: FunctionId) -> Result<(), JitError> {
        let callee = self.module.function(target);
        let argc = callee.definition().num_params();
        if argc > ARG_REGISTERS.len() {
            return Err(JitError::TooManyParameters(
                callee.definition().name().to_string(),
                argc,
            ));
        }

        for i in (0..argc).rev() {
            self.stack.pop_register(&mut self.buf, ARG_REGISTERS[i])?;
        }

        let offset = self.buf.len();
        let mode = if callee.definition().entry_point().is_some() {
            Assembler::new(&mut self.buf).call_rel32(0);
            AddressMode::Relative
        } else {
            let mut asm = Assembler::new(&mut self.buf);
            asm.mov_ri64(Reg::Rax, 0);
            asm.call_r(Reg::Rax);
            AddressMode::Absolute
        };
        self.calls.push(UnresolvedFunctionCall {
            target,
            offset,
            mode,
        });

        self.stack.push_register(&mut self.buf, Register::Gp(Reg::Rax));
        Ok(())
    }

    /// Pop the result into RAX and tear down the frame.
    fn emit_ret(&mut self) -> Result<(), JitError> {
        self.stack.pop_register(&mut self.buf, Register::Gp(Reg::Rax))?;
        let mut asm = Assembler::new(&mut self.buf);
        asm.mov_rr(Reg::Rsp, Reg::Rbp);
        asm.pop(Reg::Rbp);
        asm.ret();
        Ok(())
    }
}

/// Maximum number of operands simultaneously live in `func`'s body.
///
/// The frame must be sized for this depth up front; slots are never
/// spilled past the flat frame region.
fn max_operand_depth(module: &Module, func: &Function) -> usize {
    let mut depth: i64 = 0;
    let mut max: i64 = 0;
    for op in func.code() {
        match op {
            Op::PushInt(_) | Op::PushFloat(_) | Op::LoadLocal(_) | Op::LoadArg(_) => depth += 1,
            Op::Pop | Op::StoreLocal(_) | Op::Ret => depth -= 1,
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::AddFloat
            | Op::SubFloat
            | Op::MulFloat
            | Op::DivFloat => depth -= 1,
            Op::Call(target) => {
                depth -= module.function(*target).definition().num_params() as i64;
                depth += 1;
            }
        }
        max = max.max(depth);
    }
    max.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{FunctionDefinition, Type};

    fn module_with(funcs: Vec<Function>) -> (Module, Vec<FunctionId>) {
        let mut module = Module::new();
        let ids = funcs.into_iter().map(|f| module.add_function(f)).collect();
        (module, ids)
    }

    #[test]
    fn test_max_operand_depth() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("f", vec![]),
            vec![Type::Int],
            vec![
                Op::PushInt(1),
                Op::PushInt(2),
                Op::PushInt(3),
                Op::Add,
                Op::Mul,
                Op::StoreLocal(0),
                Op::LoadLocal(0),
                Op::Ret,
            ],
        )]);
        assert_eq!(max_operand_depth(&module, module.function(ids[0])), 3);
    }

    #[test]
    fn test_call_depth_accounts_for_arguments() {
        let mut module = Module::new();
        let callee = module.add_function(Function::new(
            FunctionDefinition::new("callee", vec![Type::Int, Type::Int]),
            vec![],
            vec![Op::PushInt(0), Op::Ret],
        ));
        let caller = module.add_function(Function::new(
            FunctionDefinition::new("caller", vec![]),
            vec![],
            vec![Op::PushInt(1), Op::PushInt(2), Op::Call(callee), Op::Ret],
        ));
        assert_eq!(max_operand_depth(&module, module.function(caller)), 2);
    }

    #[test]
    fn test_generate_exact_bytes_for_constant_function() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("one", vec![]),
            vec![],
            vec![Op::PushInt(1), Op::Ret],
        )]);

        let (buf, data) = CodeGenerator::generate(&module, ids[0]).unwrap();
        assert!(data.unresolved_calls.is_empty());
        assert_eq!(data.operand_stack.num_operands(), 0);
        assert_eq!(
            buf.code(),
            &[
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x48, 0x83, 0xEC, 0x10, // sub rsp, 16
                0x48, 0xC7, 0x45, 0xF8, 0x01, 0x00, 0x00, 0x00, // mov qword [rbp-8], 1
                0x48, 0x8B, 0x45, 0xF8, // mov rax, [rbp-8]
                0x48, 0x89, 0xEC, // mov rsp, rbp
                0x5D, // pop rbp
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn test_forward_call_is_absolute() {
        let mut module = Module::new();
        let callee = module.add_function(Function::new(
            FunctionDefinition::new("callee", vec![]),
            vec![],
            vec![Op::PushInt(0), Op::Ret],
        ));
        let caller = module.add_function(Function::new(
            FunctionDefinition::new("caller", vec![]),
            vec![],
            vec![Op::Call(callee), Op::Ret],
        ));

        let (buf, data) = CodeGenerator::generate(&module, caller).unwrap();
        assert_eq!(data.unresolved_calls.len(), 1);
        let call = &data.unresolved_calls[0];
        assert_eq!(call.target, callee);
        assert_eq!(call.mode, AddressMode::Absolute);
        // mov rax, imm64 (placeholder) then call rax
        let site = &buf.code()[call.offset..];
        assert_eq!(&site[..2], &[0x48, 0xB8]);
        assert_eq!(&site[10..12], &[0xFF, 0xD0]);
    }

    #[test]
    fn test_call_to_reserved_target_is_relative() {
        let mut module = Module::new();
        let callee = module.add_function(Function::new(
            FunctionDefinition::new("callee", vec![]),
            vec![],
            vec![Op::PushInt(0), Op::Ret],
        ));
        module.function_mut(callee).set_entry_point(0x7000_0000);
        let caller = module.add_function(Function::new(
            FunctionDefinition::new("caller", vec![]),
            vec![],
            vec![Op::Call(callee), Op::Ret],
        ));

        let (buf, data) = CodeGenerator::generate(&module, caller).unwrap();
        assert_eq!(data.unresolved_calls.len(), 1);
        let call = &data.unresolved_calls[0];
        assert_eq!(call.mode, AddressMode::Relative);
        assert_eq!(buf.code()[call.offset], 0xE8);
    }

    #[test]
    fn test_pop_on_empty_stack_fails() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("bad", vec![]),
            vec![],
            vec![Op::Pop, Op::PushInt(0), Op::Ret],
        )]);
        assert!(matches!(
            CodeGenerator::generate(&module, ids[0]),
            Err(JitError::StackUnderflow)
        ));
    }

    #[test]
    fn test_body_must_end_with_ret() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("open", vec![]),
            vec![],
            vec![Op::PushInt(0)],
        )]);
        assert!(matches!(
            CodeGenerator::generate(&module, ids[0]),
            Err(JitError::MissingReturn(_))
        ));
    }

    #[test]
    fn test_local_index_out_of_range() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("f", vec![]),
            vec![Type::Int],
            vec![Op::LoadLocal(1), Op::Ret],
        )]);
        assert!(matches!(
            CodeGenerator::generate(&module, ids[0]),
            Err(JitError::InvalidLocal(1))
        ));
    }

    #[test]
    fn test_too_many_parameters() {
        let (module, ids) = module_with(vec![Function::new(
            FunctionDefinition::new("wide", vec![Type::Int; 7]),
            vec![],
            vec![Op::PushInt(0), Op::Ret],
        )]);
        assert!(matches!(
            CodeGenerator::generate(&module, ids[0]),
            Err(JitError::TooManyParameters(_, 7))
        ));
    }
}
