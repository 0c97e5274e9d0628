//! System V AMD64 argument classification.
//!
//! Integer-class values use `rdi, rsi, rdx, rcx, r8, r9` (`Register(0..6)`),
//! floats use `xmm0..xmm7`. Results come back in `rax, rdx` and `xmm0, xmm1`,
//! numbered from zero again. Aggregates of at most 16 bytes are split into
//! eightbytes, each classified as SSE only when every leaf inside it is a
//! float.

use crate::{
    CallingConvention, Function, Hardware, Location, Part, ResolveError, Value, WORD, align_up,
    chunks,
};

pub const INTEGER_REGISTERS: u8 = 6;
pub const FLOAT_REGISTERS: u8 = 8;
pub const INTEGER_RESULTS: u8 = 2;
pub const FLOAT_RESULTS: u8 = 2;

const MAX_REGISTER_AGGREGATE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Class {
    Integer,
    Sse,
}

#[derive(Clone, Copy)]
struct Budget {
    gpr: u8,
    fpr: u8,
    gpr_limit: u8,
    fpr_limit: u8,
    sp: usize,
}

impl Budget {
    fn new(gpr_limit: u8, fpr_limit: u8) -> Self {
        Self {
            gpr: 0,
            fpr: 0,
            gpr_limit,
            fpr_limit,
            sp: 0,
        }
    }

    fn take(&mut self, class: Class) -> Option<Hardware> {
        match class {
            Class::Integer if self.gpr < self.gpr_limit => {
                self.gpr += 1;
                Some(Hardware::Register(self.gpr - 1))
            }
            Class::Sse if self.fpr < self.fpr_limit => {
                self.fpr += 1;
                Some(Hardware::Floating(self.fpr - 1))
            }
            _ => None,
        }
    }

    fn stack(&mut self, value: &Value) -> Location {
        self.sp = align_up(self.sp, value.align().max(WORD));
        let offset = self.sp;
        self.sp = align_up(self.sp + value.size(), WORD);
        Location::Hardware(Hardware::StackRtl(offset))
    }

    /// Assigns every eightbyte or none of them.
    fn split(&mut self, value: &Value) -> Option<Vec<Part>> {
        let saved = *self;
        let mut parts = Vec::new();
        for (offset, size, class) in classify(value) {
            match self.take(class) {
                Some(hardware) => parts.push(Part {
                    offset,
                    size,
                    hardware,
                }),
                None => {
                    *self = saved;
                    return None;
                }
            }
        }
        Some(parts)
    }
}

fn scalar_class(value: &Value) -> Class {
    if value.is_float() {
        Class::Sse
    } else {
        Class::Integer
    }
}

fn classify(value: &Value) -> Vec<(usize, usize, Class)> {
    let leaves = value.leaves();
    chunks(value)
        .into_iter()
        .map(|(offset, size)| {
            let mut class = Class::Sse;
            for (at, leaf) in &leaves {
                let overlaps = *at < offset + WORD && at + leaf.size() > offset;
                if overlaps && !leaf.is_float() {
                    class = Class::Integer;
                }
            }
            (offset, size, class)
        })
        .collect()
}

pub fn resolve(function: &Function) -> Result<CallingConvention, ResolveError> {
    if function.variadic {
        return Err(ResolveError::Variadic);
    }
    if function.rets.len() > 1 {
        return Err(ResolveError::ReturnArity(function.rets.len()));
    }

    let mut budget = Budget::new(INTEGER_REGISTERS, FLOAT_REGISTERS);
    let mut args = Vec::with_capacity(function.args.len());
    for value in &function.args {
        args.push(argument(&mut budget, value));
    }

    let mut results = Budget::new(INTEGER_RESULTS, FLOAT_RESULTS);
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

fn argument(budget: &mut Budget, value: &Value) -> Location {
    if value.size() == 0 {
        budget.sp = align_up(budget.sp, WORD);
        return Location::Empty;
    }
    if value.is_struct() {
        if value.size() > MAX_REGISTER_AGGREGATE {
            return budget.stack(value);
        }
        return match budget.split(value) {
            Some(parts) => Location::Multiple(parts),
            None => budget.stack(value),
        };
    }
    match budget.take(scalar_class(value)) {
        Some(hardware) => Location::Hardware(hardware),
        None => budget.stack(value),
    }
}

fn result(budget: &mut Budget, value: &Value) -> Result<Location, ResolveError> {
    if value.size() == 0 {
        return Ok(Location::Empty);
    }
    if value.is_struct() {
        if value.size() > MAX_REGISTER_AGGREGATE {
            return Err(ResolveError::UnsupportedAggregate { size: value.size() });
        }
        return budget
            .split(value)
            .map(Location::Multiple)
            .ok_or(ResolveError::UnsupportedAggregate { size: value.size() });
    }
    budget
        .take(scalar_class(value))
        .map(Location::Hardware)
        .ok_or(ResolveError::UnsupportedAggregate { size: value.size() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_float_pair_shares_one_sse_register() {
        let value = Value::Struct(vec![Value::Float4, Value::Float4]);
        let cc = resolve(&Function::new(vec![value], vec![])).expect("resolve");
        assert_eq!(
            cc.args[0],
            Location::Multiple(vec![Part {
                offset: 0,
                size: 8,
                hardware: Hardware::Floating(0),
            }])
        );
    }

    #[test]
    fn mixed_eightbyte_is_integer_class() {
        let value = Value::Struct(vec![Value::Float4, Value::Bytes4, Value::Float8]);
        let cc = resolve(&Function::new(vec![value], vec![])).expect("resolve");
        assert_eq!(
            cc.args[0],
            Location::Multiple(vec![
                Part {
                    offset: 0,
                    size: 8,
                    hardware: Hardware::Register(0),
                },
                Part {
                    offset: 8,
                    size: 8,
                    hardware: Hardware::Floating(0),
                },
            ])
        );
    }

    #[test]
    fn aggregate_rolls_back_when_registers_run_out() {
        let pair = Value::Struct(vec![Value::Bytes8, Value::Bytes8]);
        let mut args = vec![Value::Bytes8; 5];
        args.push(pair);
        args.push(Value::Bytes8);
        let cc = resolve(&Function::new(args, vec![])).expect("resolve");
        assert_eq!(cc.args[5], Location::Hardware(Hardware::StackRtl(0)));
        assert_eq!(cc.args[6], Location::Hardware(Hardware::Register(5)));
    }

    #[test]
    fn large_struct_result_is_rejected() {
        let big = Value::Struct(vec![Value::Bytes8; 3]);
        let err = resolve(&Function::new(vec![], vec![big])).expect_err("sret");
        assert_eq!(err, ResolveError::UnsupportedAggregate { size: 24 });
    }
}
