use super::{CpuContext, CrashContext, Register};

// Indices into mcontext_t::gregs
const REG_EBP: usize = 6;
const REG_ESP: usize = 7;
const REG_EIP: usize = 14;

const GENERAL_REGISTERS: [(&str, usize); 19] = [
    ("gs", 0),
    ("fs", 1),
    ("es", 2),
    ("ds", 3),
    ("edi", 4),
    ("esi", 5),
    ("ebp", REG_EBP),
    ("esp", REG_ESP),
    ("ebx", 8),
    ("edx", 9),
    ("ecx", 10),
    ("eax", 11),
    ("trapno", 12),
    ("err", 13),
    ("eip", REG_EIP),
    ("cs", 15),
    ("eflags", 16),
    ("uesp", 17),
    ("ss", 18),
];

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.context.uc_mcontext.gregs[REG_EIP] as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.context.uc_mcontext.gregs[REG_ESP] as usize
    }

    fn fill_registers(&self, out: &mut Vec<Register>) {
        let gregs = &self.context.uc_mcontext.gregs;
        out.extend(
            GENERAL_REGISTERS
                .iter()
                .map(|&(name, idx)| Register::new(name, gregs[idx] as u32 as u64)),
        );

        let fs = &self.float_state;
        out.push(Register::new("fcw", fs.cw as u64));
        out.push(Register::new("fsw", fs.sw as u64));
        out.push(Register::new("ftw", fs.tag as u64));
    }
}
