use crate::instruction::Instruction;

/// Instructions uploaded per cycle while loading a kernel.
pub const LOAD_WIDTH: usize = 4;

/// Flat instruction memory.
///
/// Written by the work scheduler while loading a kernel, read by the
/// fetch units of all clusters afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IMem {
    program: Vec<Instruction>,
    nop: Instruction,
}

impl IMem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the current program.
    pub fn reset(&mut self) {
        self.program.clear();
    }

    /// Upload up to [`LOAD_WIDTH`] instructions starting at `pc`.
    ///
    /// # Panics
    /// If more than [`LOAD_WIDTH`] instructions are written at once or the
    /// upload is not contiguous.
    pub fn write(&mut self, pc: usize, instructions: &[Instruction]) {
        assert!(
            instructions.len() <= LOAD_WIDTH,
            "imem: {} instructions written in one cycle (max {})",
            instructions.len(),
            LOAD_WIDTH
        );
        assert_eq!(
            pc,
            self.program.len(),
            "imem: non-contiguous upload at pc {pc}"
        );
        self.program.extend_from_slice(instructions);
        log::trace!("imem: uploaded pc {}..{}", pc, self.program.len());
    }

    /// Read the instruction at `pc`.
    ///
    /// Invalid requests and addresses outside the program read as no-op.
    #[must_use]
    pub fn read(&self, pc: Option<usize>) -> &Instruction {
        pc.and_then(|pc| self.program.get(pc)).unwrap_or(&self.nop)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.program.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::IMem;
    use crate::instruction::{Instruction, Operand};

    #[test]
    fn test_invalid_reads_return_nop() {
        let mut imem = IMem::new();
        let program = vec![
            Instruction::mov(Operand::vector(0), Operand::Immediate(1)),
            Instruction::exit(),
        ];
        imem.write(0, &program);
        assert_eq!(imem.read(Some(1)), &Instruction::exit());
        assert_eq!(imem.read(Some(2)), &Instruction::nop());
        assert_eq!(imem.read(None), &Instruction::nop());

        imem.reset();
        assert_eq!(imem.read(Some(0)), &Instruction::nop());
    }

    #[test]
    #[should_panic(expected = "instructions written in one cycle")]
    fn test_upload_is_limited_per_cycle() {
        let mut imem = IMem::new();
        imem.write(0, &vec![Instruction::nop(); 5]);
    }
}
