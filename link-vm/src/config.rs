use std::env;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchMode {
    /// Direct when the build target has a trampoline, generic otherwise.
    Auto,
    Direct,
    Generic,
}

impl DispatchMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(DispatchMode::Auto),
            "direct" => Some(DispatchMode::Direct),
            "generic" => Some(DispatchMode::Generic),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub dispatch: DispatchMode,
    /// Logs each compiled program's disassembly at trace level.
    pub trace_programs: bool,
    /// Upper bound on call-local heap bytes per invocation.
    pub max_call_heap: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::Auto,
            trace_programs: false,
            max_call_heap: 1 << 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?} for {}", self.value, self.key)
    }
}

impl std::error::Error for ConfigError {}

impl LinkConfig {
    /// Defaults overlaid with `LINK_DISPATCH`, `LINK_TRACE_PROGRAMS` and
    /// `LINK_MAX_CALL_HEAP`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup("LINK_DISPATCH") {
            config.dispatch = DispatchMode::parse(&value).ok_or(ConfigError {
                key: "LINK_DISPATCH",
                value,
            })?;
        }
        if let Some(value) = lookup("LINK_TRACE_PROGRAMS") {
            config.trace_programs = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError {
                        key: "LINK_TRACE_PROGRAMS",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("LINK_MAX_CALL_HEAP") {
            config.max_call_heap = value.trim().parse().map_err(|_| ConfigError {
                key: "LINK_MAX_CALL_HEAP",
                value: value.clone(),
            })?;
        }
        Ok(config)
    }
}

pub fn direct_dispatch_supported() -> bool {
    (cfg!(target_arch = "x86_64") && cfg!(unix))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}
