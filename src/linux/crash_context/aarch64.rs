use super::{CpuContext, CrashContext, Register};

const X_NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr",
];

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.context.uc_mcontext.pc as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.context.uc_mcontext.sp as usize
    }

    fn fill_registers(&self, out: &mut Vec<Register>) {
        let mc = &self.context.uc_mcontext;
        out.extend(
            X_NAMES
                .iter()
                .zip(mc.regs.iter())
                .map(|(name, value)| Register::new(*name, *value)),
        );
        out.push(Register::new("sp", mc.sp));
        out.push(Register::new("pc", mc.pc));
        out.push(Register::new("pstate", mc.pstate));
        out.push(Register::new("fault_address", mc.fault_address));
        out.push(Register::new("fpsr", self.float_state.fpsr as u64));
        out.push(Register::new("fpcr", self.float_state.fpcr as u64));
    }
}
