mod common;
use common::*;

use link_abi::{Hardware, Location};

const FREAD: &str = "fread func(&void[=@3],size_t*=@1,size_t,&FILE)size_t=@3; ferror(@4)";

fn fread_program() -> Program {
    Compiler::new(config(DispatchMode::Generic))
        .with_symbol("ferror", libc::ferror as usize)
        .link(FREAD, libc::fread as usize)
        .expect("fread should compile")
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn add_uses_the_first_two_integer_registers_on_amd64() {
    let program = link_with(DispatchMode::Direct, "add func(int,int)int", add as usize);
    assert_eq!(
        program.target.args,
        vec![
            Location::Hardware(Hardware::Register(0)),
            Location::Hardware(Hardware::Register(1)),
        ]
    );
    assert_eq!(program.target.rets, vec![Location::Hardware(Hardware::Register(0))]);
    assert_eq!(
        program.instructions().expect("decode"),
        vec![
            Instruction::Move(Width::W32, 0),
            Instruction::Extend(Width::W32),
            Instruction::Copy(Width::W32, Slot::Gpr(0)),
            Instruction::Move(Width::W32, 8),
            Instruction::Extend(Width::W32),
            Instruction::Copy(Width::W32, Slot::Gpr(1)),
            Instruction::Call,
            Instruction::Load(Width::W32, Slot::Gpr(0)),
            Instruction::Extend(Width::W32),
            Instruction::Return(ReturnKind::Scalar),
        ]
    );
}

#[test]
fn fread_checks_capacity_before_the_call_and_count_after() {
    let program = fread_program();
    let instructions = program.instructions().expect("decode");
    let call = instructions
        .iter()
        .position(|instruction| *instruction == Instruction::Call)
        .expect("call");

    let before: Vec<_> = instructions[..call]
        .iter()
        .filter(|instruction| matches!(instruction, Instruction::Guard(_)))
        .collect();
    let after: Vec<_> = instructions[call..]
        .iter()
        .filter(|instruction| matches!(instruction, Instruction::Guard(_)))
        .collect();
    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 1);

    let conditions: Vec<(&str, &str)> = program
        .checks
        .iter()
        .map(|check| (check.subject.as_str(), check.condition.as_str()))
        .collect();
    assert_eq!(
        conditions,
        vec![
            ("argument 1", "[=@3]"),
            ("argument 2", "*=@1"),
            ("return", "=@3"),
        ]
    );
    assert!(program.checks.iter().all(|check| check
        .handler
        .as_ref()
        .is_some_and(|handler| handler.name == "ferror")));
}

#[test]
fn capacity_comparison_is_strict() {
    let program = fread_program();
    let instructions = program.instructions().expect("decode");
    assert!(instructions.contains(&Instruction::Assert {
        relation: link::tag::Relation::Gt,
        signed: false,
    }));
}

#[test]
fn derived_parameters_take_no_host_argument() {
    let program = link_with(
        DispatchMode::Generic,
        "fread func(&void,-size_t=1,-size_t[=@1],&FILE)size_t",
        libc::fread as usize,
    );
    assert_eq!(program.host.args, vec![HostType::Bytes, HostType::Pointer]);
    let instructions = program.instructions().expect("decode");
    assert_eq!(program.data, vec![1]);
    assert!(instructions.contains(&Instruction::Data(0)));
    assert!(instructions.contains(&Instruction::SwapLength));
}

#[test]
fn derived_capacity_must_name_a_buffer() {
    let err = Compiler::new(config(DispatchMode::Generic))
        .link("fill func(&void,int,-size_t[=@2])void", 0x1000)
        .expect_err("reference");
    assert_eq!(
        err.kind,
        CompileErrorKind::ArgumentReference {
            position: 3,
            index: 2
        }
    );
}

#[test]
fn sold_strings_are_copied_and_kept_strings_are_leased() {
    let sold = link_with(DispatchMode::Generic, "take func($char)void", 0x1000);
    assert!(sold.instructions().expect("decode").contains(&Instruction::StringCopy));

    let kept = link_with(DispatchMode::Generic, "hold func(*char)void", 0x1000);
    let instructions = kept.instructions().expect("decode");
    assert!(instructions.contains(&Instruction::PointerKeep));
    assert!(!instructions.contains(&Instruction::StringCopy));
}

#[test]
fn static_strings_are_rejected() {
    let err = compile_err("puts func(~char)int", vec![HostType::Str], vec![HostType::I32]);
    assert_eq!(
        err.kind,
        CompileErrorKind::UnsupportedOwnership {
            position: 1,
            ownership: '~',
            host: HostType::Str,
        }
    );
}

#[test]
fn keep_pointer_pins_its_host_argument() {
    let program = link_with(DispatchMode::Generic, "adopt func(*FILE)void", 0x1000);
    assert!(program
        .instructions()
        .expect("decode")
        .contains(&Instruction::PointerPin(0)));
}

#[test]
fn sold_result_handles_are_pinned() {
    let program = link_with(DispatchMode::Generic, "tmpfile func()$FILE", libc::tmpfile as usize);
    let instructions = program.instructions().expect("decode");
    assert!(instructions.contains(&Instruction::PointerPin(link::program::PIN_NO_SOURCE)));
}

#[test]
fn string_results_need_an_ownership_the_host_can_honour() {
    let program = link_with(DispatchMode::Generic, "getenv func(&char)~char", libc::getenv as usize);
    assert_eq!(
        program.instructions().expect("decode").last(),
        Some(&Instruction::Return(ReturnKind::Str))
    );

    let program = link_with(DispatchMode::Generic, "strdup func(&char)$char", libc::strdup as usize);
    assert_eq!(
        program.instructions().expect("decode").last(),
        Some(&Instruction::Return(ReturnKind::StrFree))
    );

    let err = compile_err("name func()*char", vec![], vec![HostType::Str]);
    assert!(matches!(
        err.kind,
        CompileErrorKind::UnsupportedOwnership {
            position: 0,
            ownership: '*',
            ..
        }
    ));
}

#[test]
fn unknown_constants_fail_to_compile() {
    let err = Compiler::new(config(DispatchMode::Generic))
        .link("fgetc func(&FILE)int!=NOT_A_CONSTANT", 0x1000)
        .expect_err("constant");
    assert_eq!(
        err.kind,
        CompileErrorKind::UnknownConstant("NOT_A_CONSTANT".to_string())
    );
}

#[test]
fn host_argument_count_must_match() {
    let err = compile_err("add func(int,int)int", vec![HostType::I32], vec![HostType::I32]);
    assert_eq!(err.kind, CompileErrorKind::ArgumentCount { expected: 2, got: 1 });
}

#[test]
fn compile_errors_name_the_symbol() {
    let err = compile_err("add func(int,int)int", vec![HostType::I32], vec![HostType::I32]);
    assert!(err.to_string().starts_with("add: "));
}

#[test]
fn disassembly_lists_checks_and_mnemonics() {
    let text = fread_program().disassemble();
    assert!(text.starts_with("fread @ 0x"));
    assert!(text.contains("argument 1 [=@3]"));
    assert!(text.contains("call"));
}

#[test]
fn direct_dispatch_is_refused_without_a_trampoline() {
    if direct_dispatch_supported() {
        return;
    }
    let err = Compiler::new(config(DispatchMode::Direct))
        .link("add func(int,int)int", add as usize)
        .expect_err("direct");
    assert_eq!(err.kind, CompileErrorKind::DirectUnavailable);
}

fn compile_err(tag: &str, args: Vec<HostType>, rets: Vec<HostType>) -> CompileError {
    let (symbols, ty) = parse(tag).expect("parse");
    Compiler::new(config(DispatchMode::Generic))
        .compile(&symbols[0], 0x1000, &ty, &HostSignature::new(args, rets))
        .expect_err("tag should not compile")
}
