//! Process-wide memoization of parsed tags, compiled programs and resolved
//! calling conventions.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use link_abi::{Arch, CallingConvention, Function, ResolveError};

use crate::compiler::CompileError;
use crate::program::Program;
use crate::tag::{self, SyntaxError, Type};

fn lock<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn memoize<K, V>(map: &Mutex<HashMap<K, V>>, key: K, f: impl FnOnce() -> V) -> V
where
    K: Eq + Hash,
    V: Clone,
{
    if let Some(value) = lock(map).get(&key) {
        return value.clone();
    }
    let value = f();
    lock(map).entry(key).or_insert(value).clone()
}

type Parsed = Result<Arc<(Vec<String>, Type)>, SyntaxError>;

static TAGS: OnceLock<Mutex<HashMap<String, Parsed>>> = OnceLock::new();

pub fn parse_cached(tag: &str) -> Parsed {
    let tags = TAGS.get_or_init(Default::default);
    memoize(tags, tag.to_string(), || tag::parse(tag).map(Arc::new))
}

static CONVENTIONS: OnceLock<Mutex<HashMap<(Function, Arch), Result<CallingConvention, ResolveError>>>> =
    OnceLock::new();

pub fn calling_convention(function: &Function, arch: Arch) -> Result<CallingConvention, ResolveError> {
    let conventions = CONVENTIONS.get_or_init(Default::default);
    memoize(conventions, (function.clone(), arch), || arch.resolve(function))
}

type Slot = Arc<OnceLock<Result<Arc<Program>, CompileError>>>;

/// Compiled programs keyed by whatever identifies a signature to the caller,
/// usually the tag plus the host signature.
#[derive(Default)]
pub struct ProgramCache {
    programs: Mutex<HashMap<String, Slot>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the program for `key`, compiling it with `f` on first use.
    /// Concurrent first callers wait for a single compilation.
    pub fn get_or_compile(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<Program, CompileError>,
    ) -> Result<Arc<Program>, CompileError> {
        let slot = lock(&self.programs)
            .entry(key.to_string())
            .or_default()
            .clone();
        slot.get_or_init(|| f().map(Arc::new)).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.programs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
