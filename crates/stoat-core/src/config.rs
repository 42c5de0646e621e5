// Config — process-wide dtype defaults
//
// Two knobs are read by the core:
//
//   floatx         — dtype given to variables that don't specify one and
//                    whose initializer is a generator (default: float32)
//   compute_dtype  — dtype float variables present on read when autocasting
//                    (default: none, reads return the storage dtype)
//
// An active autocast scope (`scope::autocast_scope`) takes precedence over
// `compute_dtype`. The values can be seeded from STOAT_FLOATX and
// STOAT_COMPUTE_DTYPE.

use std::sync::RwLock;

use crate::dtype::DType;
use crate::error::Result;

pub const FLOATX_ENV: &str = "STOAT_FLOATX";
pub const COMPUTE_DTYPE_ENV: &str = "STOAT_COMPUTE_DTYPE";

/// Global dtype configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Default dtype for new variables.
    pub floatx: DType,
    /// Dtype float variables are read as when autocasting. `None` disables it.
    pub compute_dtype: Option<DType>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            floatx: DType::F32,
            compute_dtype: None,
        }
    }
}

impl Config {
    /// Set the default variable dtype.
    pub fn with_floatx(mut self, floatx: DType) -> Self {
        self.floatx = floatx;
        self
    }

    /// Set the autocast compute dtype.
    pub fn with_compute_dtype(mut self, dtype: Option<DType>) -> Self {
        self.compute_dtype = dtype;
        self
    }

    /// Defaults overridden by `STOAT_FLOATX` / `STOAT_COMPUTE_DTYPE`, when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(v) = std::env::var(FLOATX_ENV) {
            config.floatx = v.parse()?;
        }
        if let Ok(v) = std::env::var(COMPUTE_DTYPE_ENV) {
            config.compute_dtype = Some(v.parse()?);
        }
        Ok(config)
    }
}

static CONFIG: RwLock<Config> = RwLock::new(Config {
    floatx: DType::F32,
    compute_dtype: None,
});

/// Snapshot of the current configuration.
pub fn get() -> Config {
    match CONFIG.read() {
        Ok(c) => *c,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Replace the whole configuration.
pub fn set_config(config: Config) {
    tracing::debug!(?config, "updating stoat config");
    match CONFIG.write() {
        Ok(mut c) => *c = config,
        Err(poisoned) => *poisoned.into_inner() = config,
    }
}

pub fn floatx() -> DType {
    get().floatx
}

pub fn set_floatx(dtype: DType) {
    set_config(get().with_floatx(dtype));
}

pub fn compute_dtype() -> Option<DType> {
    get().compute_dtype
}

pub fn set_compute_dtype(dtype: Option<DType>) {
    set_config(get().with_compute_dtype(dtype));
}
