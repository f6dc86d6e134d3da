use super::{CpuContext, CrashContext, Register};

impl CpuContext for CrashContext {
    fn get_instruction_pointer(&self) -> usize {
        self.context.uc_mcontext.arm_pc as usize
    }

    fn get_stack_pointer(&self) -> usize {
        self.context.uc_mcontext.arm_sp as usize
    }

    fn fill_registers(&self, out: &mut Vec<Register>) {
        let mc = &self.context.uc_mcontext;
        out.extend(
            [
                ("r0", mc.arm_r0),
                ("r1", mc.arm_r1),
                ("r2", mc.arm_r2),
                ("r3", mc.arm_r3),
                ("r4", mc.arm_r4),
                ("r5", mc.arm_r5),
                ("r6", mc.arm_r6),
                ("r7", mc.arm_r7),
                ("r8", mc.arm_r8),
                ("r9", mc.arm_r9),
                ("r10", mc.arm_r10),
                ("fp", mc.arm_fp),
                ("ip", mc.arm_ip),
                ("sp", mc.arm_sp),
                ("lr", mc.arm_lr),
                ("pc", mc.arm_pc),
                ("cpsr", mc.arm_cpsr),
                ("fault_address", mc.fault_address),
            ]
            .into_iter()
            .map(|(name, value)| Register::new(name, value as u64)),
        );
    }
}
