mod common;
use common::*;

use std::ffi::c_char;

extern "C" fn stash(text: *const c_char, _count: i32) -> usize {
    text as usize
}

// The lease table is process-wide, so these checks share one test to keep
// `held()` stable.
#[test]
fn leases_are_taken_only_when_the_call_runs() {
    let program = link_with(
        DispatchMode::Generic,
        "stash func(*char,int>0)uintptr_t",
        stash as usize,
    );
    let before = leases().held();

    let err = program
        .invoke(&mut [HostValue::Str("leak".to_string()), HostValue::I32(-1)])
        .expect_err("guard");
    assert!(matches!(err, CallError::Assertion { ref check, .. } if check == "argument 2 >0"));
    assert_eq!(leases().held(), before);

    let result = program
        .invoke(&mut [HostValue::Str("kept".to_string()), HostValue::I32(1)])
        .expect("call");
    let HostValue::Usize(address) = result else {
        panic!("unexpected result {result:?}");
    };
    assert_eq!(leases().held(), before + 1);
    assert!(leases().release(address));
    assert_eq!(leases().held(), before);
}
