pub mod amd64;
pub mod arm64;
pub mod zero;

/// Pointer-sized word used for stack slot rounding on every supported target.
pub const WORD: usize = 8;

/// Canonical fixed-size shape of a value crossing the native boundary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Bytes0,
    Bytes1,
    Bytes2,
    Bytes4,
    Bytes8,
    Float4,
    Float8,
    Memory,
    Sizing,
    Struct(Vec<Value>),
}

impl Value {
    pub fn size(&self) -> usize {
        match self {
            Value::Bytes0 => 0,
            Value::Bytes1 => 1,
            Value::Bytes2 => 2,
            Value::Bytes4 | Value::Float4 => 4,
            Value::Bytes8 | Value::Float8 | Value::Memory | Value::Sizing => 8,
            Value::Struct(fields) => {
                let mut size = 0;
                for field in fields {
                    size = align_up(size, field.align()) + field.size();
                }
                align_up(size, self.align())
            }
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Value::Bytes0 => 1,
            Value::Struct(fields) => fields.iter().map(Value::align).max().unwrap_or(1),
            other => other.size(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::Float4 | Value::Float8)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Value::Struct(_))
    }

    /// Immediate fields paired with their byte offset inside the struct.
    pub fn fields(&self) -> Vec<(usize, Value)> {
        let Value::Struct(fields) = self else {
            return vec![(0, self.clone())];
        };
        let mut offset = 0;
        let mut out = Vec::with_capacity(fields.len());
        for field in fields {
            offset = align_up(offset, field.align());
            out.push((offset, field.clone()));
            offset += field.size();
        }
        out
    }

    /// Every non-empty scalar reachable from this value, with absolute offsets.
    pub fn leaves(&self) -> Vec<(usize, Value)> {
        let mut out = Vec::new();
        self.collect_leaves(0, &mut out);
        out
    }

    fn collect_leaves(&self, base: usize, out: &mut Vec<(usize, Value)>) {
        match self {
            Value::Struct(_) => {
                for (offset, field) in self.fields() {
                    field.collect_leaves(base + offset, out);
                }
            }
            Value::Bytes0 => {}
            scalar => out.push((base, scalar.clone())),
        }
    }

    /// Returns the element shape and count when every leaf is the same float
    /// shape and there are at most four of them.
    pub fn homogeneous_float(&self) -> Option<(Value, usize)> {
        if !self.is_struct() {
            return None;
        }
        let leaves = self.leaves();
        let (_, first) = leaves.first()?;
        if !first.is_float() || leaves.len() > 4 {
            return None;
        }
        if leaves.iter().any(|(_, leaf)| leaf != first) {
            return None;
        }
        Some((first.clone(), leaves.len()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hardware {
    Register(u8),
    Floating(u8),
    StackRtl(usize),
}

/// A byte range of a decomposed value and where that range is placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Part {
    pub offset: usize,
    pub size: usize,
    pub hardware: Hardware,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// Zero-size value, nothing is transferred.
    Empty,
    /// Handed back to the caller as the result of the invocation.
    Returned,
    Hardware(Hardware),
    Multiple(Vec<Part>),
    /// Passed by reference: the pointer lives at `pointer` and addresses the
    /// value at `relative` bytes past its start.
    Indirect { pointer: Hardware, relative: usize },
}

impl Location {
    pub fn uses_stack(&self) -> bool {
        match self {
            Location::Hardware(Hardware::StackRtl(_)) => true,
            Location::Multiple(parts) => parts
                .iter()
                .any(|part| matches!(part.hardware, Hardware::StackRtl(_))),
            Location::Indirect { pointer, .. } => matches!(pointer, Hardware::StackRtl(_)),
            _ => false,
        }
    }

    pub fn stack_offset(&self) -> Option<usize> {
        match self {
            Location::Hardware(Hardware::StackRtl(offset)) => Some(*offset),
            Location::Indirect {
                pointer: Hardware::StackRtl(offset),
                ..
            } => Some(*offset),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Function {
    pub args: Vec<Value>,
    pub rets: Vec<Value>,
    pub variadic: bool,
}

impl Function {
    pub fn new(args: Vec<Value>, rets: Vec<Value>) -> Self {
        Self {
            args,
            rets,
            variadic: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallingConvention {
    pub args: Vec<Location>,
    pub rets: Vec<Location>,
    /// Bytes of parameter area required, rounded to 16.
    pub stack: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    Variadic,
    ReturnArity(usize),
    UnsupportedAggregate { size: usize },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Variadic => {
                write!(f, "variadic arguments are not supported by this calling convention")
            }
            ResolveError::ReturnArity(count) => {
                write!(f, "expected at most one return value, got {count}")
            }
            ResolveError::UnsupportedAggregate { size } => {
                write!(f, "unsupported aggregate of {size} bytes")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Generic,
}

impl Arch {
    /// Register-level architecture of the build target, or `Generic` when no
    /// register resolver applies.
    pub fn native() -> Arch {
        if cfg!(all(target_arch = "x86_64", unix)) {
            Arch::Amd64
        } else if cfg!(all(
            target_arch = "aarch64",
            any(target_os = "linux", target_os = "macos")
        )) {
            Arch::Arm64
        } else {
            Arch::Generic
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Generic => "generic",
        }
    }

    pub fn resolve(self, function: &Function) -> Result<CallingConvention, ResolveError> {
        match self {
            Arch::Amd64 => amd64::resolve(function),
            Arch::Arm64 => arm64::resolve(function),
            Arch::Generic => zero::resolve(function),
        }
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Eightbyte chunks of a value image, each reported with the size actually
/// covered by the value.
pub(crate) fn chunks(value: &Value) -> Vec<(usize, usize)> {
    let size = value.size();
    (0..size)
        .step_by(WORD)
        .map(|offset| (offset, WORD.min(size - offset)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_size_includes_interior_and_tail_padding() {
        let value = Value::Struct(vec![Value::Bytes1, Value::Bytes4, Value::Bytes2]);
        assert_eq!(value.size(), 12);
        assert_eq!(value.align(), 4);
        let offsets: Vec<usize> = value.fields().iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
    }

    #[test]
    fn nested_struct_leaves_carry_absolute_offsets() {
        let inner = Value::Struct(vec![Value::Bytes1, Value::Bytes4]);
        let value = Value::Struct(vec![Value::Bytes1, inner]);
        assert_eq!(
            value.leaves(),
            vec![(0, Value::Bytes1), (4, Value::Bytes1), (8, Value::Bytes4)]
        );
    }

    #[test]
    fn homogeneous_float_requires_identical_float_leaves() {
        let pair = Value::Struct(vec![Value::Float8, Value::Float8]);
        assert_eq!(pair.homogeneous_float(), Some((Value::Float8, 2)));
        let mixed = Value::Struct(vec![Value::Float4, Value::Float8]);
        assert_eq!(mixed.homogeneous_float(), None);
        let five = Value::Struct(vec![Value::Float4; 5]);
        assert_eq!(five.homogeneous_float(), None);
        assert_eq!(Value::Float8.homogeneous_float(), None);
    }

    #[test]
    fn chunks_cover_partial_tail() {
        let value = Value::Struct(vec![Value::Bytes8, Value::Bytes2]);
        assert_eq!(chunks(&value), vec![(0, 8), (8, 8)]);
        let small = Value::Struct(vec![Value::Bytes1, Value::Bytes1, Value::Bytes1]);
        assert_eq!(chunks(&small), vec![(0, 3)]);
    }
}
