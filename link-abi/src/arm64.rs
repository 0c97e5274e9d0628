//! AAPCS64 argument classification.
//!
//! `x0..x7` are `Register(0..8)` and `v0..v7` are `Floating(0..8)`. A
//! homogeneous floating aggregate of up to four members takes consecutive
//! vector registers; any other aggregate larger than 16 bytes is copied to
//! memory and passed by pointer. Apple targets pack stack arguments at their
//! natural alignment instead of rounding every slot to eight bytes.

use crate::{
    CallingConvention, Function, Hardware, Location, Part, ResolveError, Value, WORD, align_up,
    chunks,
};

pub const INTEGER_REGISTERS: u8 = 8;
pub const FLOAT_REGISTERS: u8 = 8;
pub const HFA_RESULTS: u8 = 4;

const MAX_REGISTER_AGGREGATE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    Aapcs,
    Apple,
}

impl Flavor {
    pub fn native() -> Flavor {
        if cfg!(target_vendor = "apple") {
            Flavor::Apple
        } else {
            Flavor::Aapcs
        }
    }
}

#[derive(Clone, Copy)]
struct Budget {
    ngrn: u8,
    nsrn: u8,
    gpr_limit: u8,
    fpr_limit: u8,
    sp: usize,
    flavor: Flavor,
}

impl Budget {
    fn new(gpr_limit: u8, fpr_limit: u8, flavor: Flavor) -> Self {
        Self {
            ngrn: 0,
            nsrn: 0,
            gpr_limit,
            fpr_limit,
            sp: 0,
            flavor,
        }
    }

    fn general(&mut self, count: u8) -> Option<u8> {
        if self.ngrn + count > self.gpr_limit {
            return None;
        }
        self.ngrn += count;
        Some(self.ngrn - count)
    }

    fn vector(&mut self, count: u8) -> Option<u8> {
        if self.nsrn + count > self.fpr_limit {
            return None;
        }
        self.nsrn += count;
        Some(self.nsrn - count)
    }

    fn stack_slot(&mut self, size: usize, align: usize, composite: bool) -> usize {
        let align = match self.flavor {
            Flavor::Apple if !composite => align,
            _ => align.max(WORD),
        };
        self.sp = align_up(self.sp, align);
        let offset = self.sp;
        self.sp += size;
        if self.flavor == Flavor::Aapcs || composite {
            self.sp = align_up(self.sp, WORD);
        }
        offset
    }

    fn stack(&mut self, value: &Value) -> Location {
        let offset = self.stack_slot(value.size(), value.align(), value.is_struct());
        Location::Hardware(Hardware::StackRtl(offset))
    }
}

pub fn resolve(function: &Function) -> Result<CallingConvention, ResolveError> {
    resolve_with(function, Flavor::native())
}

pub fn resolve_with(function: &Function, flavor: Flavor) -> Result<CallingConvention, ResolveError> {
    if function.variadic {
        return Err(ResolveError::Variadic);
    }
    if function.rets.len() > 1 {
        return Err(ResolveError::ReturnArity(function.rets.len()));
    }

    let mut budget = Budget::new(INTEGER_REGISTERS, FLOAT_REGISTERS, flavor);
    let mut args = Vec::with_capacity(function.args.len());
    for value in &function.args {
        args.push(argument(&mut budget, value));
    }

    let mut results = Budget::new(2, HFA_RESULTS, flavor);
    let mut rets = Vec::with_capacity(function.rets.len());
    for value in &function.rets {
        rets.push(result(&mut results, value)?);
    }

    Ok(CallingConvention {
        args,
        rets,
        stack: align_up(budget.sp, 16),
    })
}

fn hfa_parts(value: &Value, first: u8, element: &Value) -> Vec<Part> {
    value
        .leaves()
        .into_iter()
        .enumerate()
        .map(|(index, (offset, _))| Part {
            offset,
            size: element.size(),
            hardware: Hardware::Floating(first + index as u8),
        })
        .collect()
}

fn chunk_parts(value: &Value, first: u8) -> Vec<Part> {
    chunks(value)
        .into_iter()
        .enumerate()
        .map(|(index, (offset, size))| Part {
            offset,
            size,
            hardware: Hardware::Register(first + index as u8),
        })
        .collect()
}

fn argument(budget: &mut Budget, value: &Value) -> Location {
    if value.size() == 0 {
        budget.sp = align_up(budget.sp, WORD);
        return Location::Empty;
    }
    if !value.is_struct() {
        let register = if value.is_float() {
            budget.vector(1).map(Hardware::Floating)
        } else {
            budget.general(1).map(Hardware::Register)
        };
        return match register {
            Some(hardware) => Location::Hardware(hardware),
            None => budget.stack(value),
        };
    }

    if let Some((element, count)) = value.homogeneous_float() {
        return match budget.vector(count as u8) {
            Some(first) => Location::Multiple(hfa_parts(value, first, &element)),
            None => {
                budget.nsrn = budget.fpr_limit;
                budget.stack(value)
            }
        };
    }

    if value.size() > MAX_REGISTER_AGGREGATE {
        let pointer = match budget.general(1) {
            Some(register) => Hardware::Register(register),
            None => Hardware::StackRtl(budget.stack_slot(WORD, WORD, false)),
        };
        return Location::Indirect {
            pointer,
            relative: 0,
        };
    }

    let needed = value.size().div_ceil(WORD) as u8;
    match budget.general(needed) {
        Some(first) => Location::Multiple(chunk_parts(value, first)),
        None => {
            budget.ngrn = budget.gpr_limit;
            budget.stack(value)
        }
    }
}

fn result(budget: &mut Budget, value: &Value) -> Result<Location, ResolveError> {
    if value.size() == 0 {
        return Ok(Location::Empty);
    }
    let unsupported = ResolveError::UnsupportedAggregate { size: value.size() };
    if !value.is_struct() {
        let register = if value.is_float() {
            budget.vector(1).map(Hardware::Floating)
        } else {
            budget.general(1).map(Hardware::Register)
        };
        return register.map(Location::Hardware).ok_or(unsupported);
    }
    if let Some((element, count)) = value.homogeneous_float() {
        let first = budget.vector(count as u8).ok_or(unsupported)?;
        return Ok(Location::Multiple(hfa_parts(value, first, &element)));
    }
    if value.size() > MAX_REGISTER_AGGREGATE {
        return Err(unsupported);
    }
    let needed = value.size().div_ceil(WORD) as u8;
    let first = budget.general(needed).ok_or(unsupported)?;
    Ok(Location::Multiple(chunk_parts(value, first)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfa_of_four_floats_uses_four_vector_registers() {
        let value = Value::Struct(vec![Value::Float4; 4]);
        let cc = resolve_with(&Function::new(vec![value], vec![]), Flavor::Aapcs).expect("resolve");
        let Location::Multiple(parts) = &cc.args[0] else {
            panic!("expected decomposed aggregate, got {:?}", cc.args[0]);
        };
        let registers: Vec<Hardware> = parts.iter().map(|part| part.hardware).collect();
        assert_eq!(
            registers,
            vec![
                Hardware::Floating(0),
                Hardware::Floating(1),
                Hardware::Floating(2),
                Hardware::Floating(3),
            ]
        );
        assert_eq!(parts[3].offset, 12);
    }

    #[test]
    fn large_non_hfa_is_passed_by_pointer() {
        let value = Value::Struct(vec![Value::Bytes8, Value::Bytes8, Value::Bytes4]);
        let cc = resolve_with(
            &Function::new(vec![Value::Bytes4, value], vec![]),
            Flavor::Aapcs,
        )
        .expect("resolve");
        assert_eq!(
            cc.args[1],
            Location::Indirect {
                pointer: Hardware::Register(1),
                relative: 0,
            }
        );
    }

    #[test]
    fn apple_packs_small_stack_arguments() {
        let args = vec![Value::Bytes8; 8]
            .into_iter()
            .chain([Value::Bytes1, Value::Bytes1, Value::Bytes4])
            .collect();
        let function = Function::new(args, vec![]);
        let apple = resolve_with(&function, Flavor::Apple).expect("resolve");
        assert_eq!(apple.args[9], Location::Hardware(Hardware::StackRtl(1)));
        assert_eq!(apple.args[10], Location::Hardware(Hardware::StackRtl(4)));
        let linux = resolve_with(&function, Flavor::Aapcs).expect("resolve");
        assert_eq!(linux.args[9], Location::Hardware(Hardware::StackRtl(8)));
        assert_eq!(linux.args[10], Location::Hardware(Hardware::StackRtl(16)));
    }
}
