use std::collections::HashMap;

use crate::program::{Check, Instruction, Width};

/// Collects instructions for one program, interning literal data and checks.
///
/// A load whose result is already sitting in `$normal` is skipped: repeated
/// `Move`s of the same host slot, and a full-width `Load` straight after the
/// `Copy` that filled that slot.
pub struct Assembler {
    instructions: Vec<Instruction>,
    data: Vec<u64>,
    data_index: HashMap<u64, u16>,
    checks: Vec<Check>,
    normal: Option<Instruction>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            data: Vec::new(),
            data_index: HashMap::new(),
            checks: Vec::new(),
            normal: None,
        }
    }

    #[cfg(test)]
    fn position(&self) -> usize {
        self.instructions.len()
    }

    pub fn push(&mut self, instruction: Instruction) {
        if is_reload(&instruction) && self.normal == Some(instruction) {
            return;
        }
        self.track(&instruction);
        self.instructions.push(instruction);
    }

    fn track(&mut self, instruction: &Instruction) {
        match *instruction {
            Instruction::Move(..) | Instruction::Load(..) | Instruction::Data(_) => {
                self.normal = Some(*instruction);
            }
            Instruction::Copy(Width::W64, slot) => {
                self.normal = Some(Instruction::Load(Width::W64, slot));
            }
            Instruction::Copy(..)
            | Instruction::MoveLen(_)
            | Instruction::HostCopy { .. }
            | Instruction::StackCopy(_)
            | Instruction::Assert { .. }
            | Instruction::Flip
            | Instruction::Guard(_)
            | Instruction::ErrorMake(_)
            | Instruction::HeapMake
            | Instruction::HeapPut(..)
            | Instruction::PointerPin(_)
            | Instruction::PointerFree => {}
            _ => self.normal = None,
        }
    }

    pub fn data(&mut self, value: u64) -> u16 {
        if let Some(index) = self.data_index.get(&value) {
            return *index;
        }
        let index = self.data.len() as u16;
        self.data.push(value);
        self.data_index.insert(value, index);
        index
    }

    pub fn check(&mut self, check: Check) -> u16 {
        let index = self.checks.len() as u16;
        self.checks.push(check);
        index
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn finish(self) -> (Vec<u8>, Vec<u64>, Vec<Check>) {
        let mut code = Vec::with_capacity(self.instructions.len() * 4);
        for instruction in &self.instructions {
            instruction.encode(&mut code);
        }
        (code, self.data, self.checks)
    }
}

fn is_reload(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Move(..) | Instruction::Load(..) | Instruction::Data(_)
    )
}
