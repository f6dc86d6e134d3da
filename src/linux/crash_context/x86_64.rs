use super::{CpuContext, CrashContext, Register};
use libc::{
    REG_CR2, REG_CSGSFS, REG_EFL, REG_ERR, REG_R8, REG_R9, REG_R10, REG_R11, REG_R12, REG_R13,
    REG_R14, REG_R15, REG_RAX, REG_RBP, REG_RBX, REG_RCX, REG_RDI, REG_RDX, REG_RIP, REG_RSI,
    REG_RSP, REG_TRAPNO,
};

const GENERAL_REGISTERS: [(&str, libc::c_int); 22] = [
    ("rax", REG_RAX),
    ("rbx", REG_RBX),
    ("rcx", REG_RCX),
    ("rdx", REG_RDX),
    ("rsi", REG_RSI),
    ("rdi", REG_RDI),
    ("rbp", REG_RBP),
    ("rsp", REG_RSP),
    ("r8", REG_R8),
    ("r9", REG_R9),
    ("r10", REG_R10),
    ("r11", REG_R11),
    ("r12", REG_R12),
    ("r13", REG_R13),
    ("r14", REG_R14),
    ("r15", REG_R15),
    ("rip", REG_RIP),
    ("eflags", REG_EFL),
    ("csgsfs", REG_CSGSFS),
    ("err", REG_ERR),
    ("trapno", REG_TRAPNO),
    ("cr2", REG_CR2),
];

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.context.uc_mcontext.gregs[REG_RIP as usize] as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.context.uc_mcontext.gregs[REG_RSP as usize] as usize
    }

    fn fill_registers(&self, out: &mut Vec<Register>) {
        let gregs = &self.context.uc_mcontext.gregs;
        out.extend(
            GENERAL_REGISTERS
                .iter()
                .map(|&(name, idx)| Register::new(name, gregs[idx as usize] as u64)),
        );

        let fs = &self.float_state;
        out.push(Register::new("fcw", fs.cwd as u64));
        out.push(Register::new("fsw", fs.swd as u64));
        out.push(Register::new("mxcsr", fs.mxcsr as u64));
    }
}
