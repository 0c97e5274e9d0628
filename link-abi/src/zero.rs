//! Portable stack-only convention. Every value is laid out left to right in a
//! single parameter area, results follow the arguments. This is also the
//! layout used for host frames.

use crate::{CallingConvention, Function, Hardware, Location, ResolveError, Value, WORD, align_up};

pub fn resolve(function: &Function) -> Result<CallingConvention, ResolveError> {
    if function.rets.len() > 1 {
        return Err(ResolveError::ReturnArity(function.rets.len()));
    }
    let mut sp = 0;
    let args = function
        .args
        .iter()
        .map(|value| place(value, &mut sp))
        .collect();
    let rets = function
        .rets
        .iter()
        .map(|value| place(value, &mut sp))
        .collect();
    Ok(CallingConvention {
        args,
        rets,
        stack: align_up(sp, 16),
    })
}

fn place(value: &Value, sp: &mut usize) -> Location {
    if value.size() == 0 {
        *sp = align_up(*sp, WORD);
        return Location::Empty;
    }
    *sp = align_up(*sp, value.align());
    let offset = *sp;
    *sp = align_up(*sp + value.size(), WORD);
    Location::Hardware(Hardware::StackRtl(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_use_word_slots_and_results_follow() {
        let function = Function::new(
            vec![Value::Bytes1, Value::Bytes4, Value::Float8],
            vec![Value::Bytes4],
        );
        let cc = resolve(&function).expect("resolve");
        assert_eq!(
            cc.args,
            vec![
                Location::Hardware(Hardware::StackRtl(0)),
                Location::Hardware(Hardware::StackRtl(8)),
                Location::Hardware(Hardware::StackRtl(16)),
            ]
        );
        assert_eq!(cc.rets, vec![Location::Hardware(Hardware::StackRtl(24))]);
        assert_eq!(cc.stack, 32);
    }

    #[test]
    fn strings_occupy_two_words() {
        let string = Value::Struct(vec![Value::Memory, Value::Sizing]);
        let function = Function::new(vec![string, Value::Bytes8], vec![]);
        let cc = resolve(&function).expect("resolve");
        assert_eq!(cc.args[1], Location::Hardware(Hardware::StackRtl(16)));
    }

    #[test]
    fn zero_size_values_take_no_slot() {
        let function = Function::new(vec![Value::Bytes1, Value::Bytes0, Value::Bytes1], vec![]);
        let cc = resolve(&function).expect("resolve");
        assert_eq!(cc.args[1], Location::Empty);
        assert_eq!(cc.args[2], Location::Hardware(Hardware::StackRtl(8)));
    }

    #[test]
    fn accepts_variadic_layouts() {
        let mut function = Function::new(vec![Value::Memory], vec![Value::Bytes4]);
        function.variadic = true;
        assert!(resolve(&function).is_ok());
    }
}
