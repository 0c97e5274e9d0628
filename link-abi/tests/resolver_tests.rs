use link_abi::arm64::Flavor;
use link_abi::{Arch, Function, Hardware, Location, Part, ResolveError, Value, align_up, arm64};

fn scalars() -> Vec<Value> {
    vec![
        Value::Bytes1,
        Value::Bytes2,
        Value::Bytes4,
        Value::Bytes8,
        Value::Float4,
        Value::Float8,
        Value::Memory,
        Value::Sizing,
    ]
}

#[test]
fn scalar_sizes_match_native_layout() {
    assert_eq!(Value::Bytes1.size(), std::mem::size_of::<u8>());
    assert_eq!(Value::Bytes2.size(), std::mem::size_of::<u16>());
    assert_eq!(Value::Bytes4.size(), std::mem::size_of::<u32>());
    assert_eq!(Value::Bytes8.size(), std::mem::size_of::<u64>());
    assert_eq!(Value::Float4.size(), std::mem::size_of::<f32>());
    assert_eq!(Value::Float8.size(), std::mem::size_of::<f64>());
    assert_eq!(Value::Memory.size(), std::mem::size_of::<*const u8>());
    assert_eq!(Value::Sizing.size(), std::mem::size_of::<usize>());

    assert_eq!(Value::Bytes2.align(), std::mem::align_of::<u16>());
    assert_eq!(Value::Bytes4.align(), std::mem::align_of::<u32>());
    assert_eq!(Value::Bytes8.align(), std::mem::align_of::<u64>());
    assert_eq!(Value::Float8.align(), std::mem::align_of::<f64>());
    assert_eq!(Value::Memory.align(), std::mem::align_of::<*const u8>());
}

#[test]
fn struct_layout_matches_repr_c() {
    #[repr(C)]
    struct Mixed {
        _a: u8,
        _b: f64,
        _c: u16,
    }
    let value = Value::Struct(vec![Value::Bytes1, Value::Float8, Value::Bytes2]);
    assert_eq!(value.size(), std::mem::size_of::<Mixed>());
    assert_eq!(value.align(), std::mem::align_of::<Mixed>());
}

#[test]
fn functions_within_register_budget_use_no_stack() {
    for arch in [Arch::Amd64, Arch::Arm64] {
        for value in scalars() {
            let args = vec![value.clone(); 6];
            let cc = arch
                .resolve(&Function::new(args, vec![value.clone()]))
                .expect("resolve");
            assert!(
                cc.args.iter().all(|location| !location.uses_stack()),
                "{} placed {value:?} on the stack: {:?}",
                arch.name(),
                cc.args
            );
            assert_eq!(cc.stack, 0);
        }
    }
}

fn overflow_offsets_are_increasing_and_dense(arch: Arch, value: Value) {
    let args = vec![value.clone(); 12];
    let cc = arch.resolve(&Function::new(args, vec![])).expect("resolve");
    let offsets: Vec<usize> = cc.args.iter().filter_map(Location::stack_offset).collect();
    assert!(!offsets.is_empty());
    for pair in offsets.windows(2) {
        assert!(pair[0] < pair[1], "{} offsets not increasing: {offsets:?}", arch.name());
    }
    for offset in &offsets {
        assert_eq!(offset % value.align(), 0);
    }
    let last = offsets[offsets.len() - 1];
    let expected = offsets.len() * align_up(value.size(), 8);
    assert_eq!(align_up(last + value.size(), 8), expected);
}

#[test]
fn overflow_arguments_get_aligned_stack_offsets() {
    overflow_offsets_are_increasing_and_dense(Arch::Amd64, Value::Bytes4);
    overflow_offsets_are_increasing_and_dense(Arch::Amd64, Value::Float8);
    overflow_offsets_are_increasing_and_dense(Arch::Generic, Value::Bytes8);
    let cc = arm64::resolve_with(&Function::new(vec![Value::Bytes8; 12], vec![]), Flavor::Aapcs)
        .expect("resolve");
    let offsets: Vec<usize> = cc.args.iter().filter_map(Location::stack_offset).collect();
    assert_eq!(offsets, vec![0, 8, 16, 24]);
    assert_eq!(cc.stack, 32);
}

#[test]
fn add_lands_in_first_two_integer_registers_on_amd64() {
    let function = Function::new(vec![Value::Bytes4, Value::Bytes4], vec![Value::Bytes4]);
    let cc = Arch::Amd64.resolve(&function).expect("resolve");
    assert_eq!(
        cc.args,
        vec![
            Location::Hardware(Hardware::Register(0)),
            Location::Hardware(Hardware::Register(1)),
        ]
    );
    assert_eq!(cc.rets, vec![Location::Hardware(Hardware::Register(0))]);
}

#[test]
fn float_and_integer_counters_are_independent() {
    let function = Function::new(
        vec![Value::Float8, Value::Bytes8, Value::Float4, Value::Memory],
        vec![Value::Float8],
    );
    for arch in [Arch::Amd64, Arch::Arm64] {
        let cc = arch.resolve(&function).expect("resolve");
        assert_eq!(
            cc.args,
            vec![
                Location::Hardware(Hardware::Floating(0)),
                Location::Hardware(Hardware::Register(0)),
                Location::Hardware(Hardware::Floating(1)),
                Location::Hardware(Hardware::Register(1)),
            ]
        );
        assert_eq!(cc.rets, vec![Location::Hardware(Hardware::Floating(0))]);
    }
}

#[test]
fn arm64_two_double_aggregate_uses_consecutive_float_registers() {
    let pair = Value::Struct(vec![Value::Float8, Value::Float8]);
    assert_eq!(pair.size(), 16);
    let function = Function::new(vec![Value::Float8, pair.clone()], vec![pair]);
    let cc = arm64::resolve_with(&function, Flavor::Aapcs).expect("resolve");
    assert_eq!(
        cc.args[1],
        Location::Multiple(vec![
            Part {
                offset: 0,
                size: 8,
                hardware: Hardware::Floating(1),
            },
            Part {
                offset: 8,
                size: 8,
                hardware: Hardware::Floating(2),
            },
        ])
    );
    assert!(!cc.args[1].uses_stack());
    assert_eq!(
        cc.rets[0],
        Location::Multiple(vec![
            Part {
                offset: 0,
                size: 8,
                hardware: Hardware::Floating(0),
            },
            Part {
                offset: 8,
                size: 8,
                hardware: Hardware::Floating(1),
            },
        ])
    );
}

#[test]
fn arm64_hfa_spills_whole_when_vector_registers_run_out() {
    let quad = Value::Struct(vec![Value::Float8; 4]);
    let mut args = vec![Value::Float8; 6];
    args.push(quad);
    args.push(Value::Float8);
    let cc = arm64::resolve_with(&Function::new(args, vec![]), Flavor::Aapcs).expect("resolve");
    assert_eq!(cc.args[6], Location::Hardware(Hardware::StackRtl(0)));
    assert_eq!(cc.args[7], Location::Hardware(Hardware::StackRtl(32)));
}

#[test]
fn register_resolvers_reject_variadics() {
    let mut function = Function::new(vec![Value::Memory], vec![Value::Bytes4]);
    function.variadic = true;
    assert_eq!(Arch::Amd64.resolve(&function), Err(ResolveError::Variadic));
    assert_eq!(Arch::Arm64.resolve(&function), Err(ResolveError::Variadic));
}

#[test]
fn more_than_one_result_is_rejected_everywhere() {
    let function = Function::new(vec![], vec![Value::Bytes4, Value::Bytes4]);
    for arch in [Arch::Amd64, Arch::Arm64, Arch::Generic] {
        assert_eq!(arch.resolve(&function), Err(ResolveError::ReturnArity(2)));
    }
}

#[test]
fn zero_size_argument_consumes_no_register() {
    let function = Function::new(vec![Value::Bytes0, Value::Bytes8], vec![]);
    let cc = Arch::Amd64.resolve(&function).expect("resolve");
    assert_eq!(cc.args[0], Location::Empty);
    assert_eq!(cc.args[1], Location::Hardware(Hardware::Register(0)));
}

#[test]
fn resolution_is_deterministic() {
    let function = Function::new(
        vec![
            Value::Struct(vec![Value::Memory, Value::Sizing]),
            Value::Float4,
            Value::Struct(vec![Value::Bytes8; 3]),
        ],
        vec![Value::Sizing],
    );
    for arch in [Arch::Amd64, Arch::Arm64, Arch::Generic] {
        assert_eq!(arch.resolve(&function), arch.resolve(&function));
    }
}
