//! Activation Functions and Lookup Tables
//!
//! # Overview
//!
//! Position-wise activation functions used by dense and recurrent layers,
//! plus precomputed lookup tables over the bounded range `[-8, 8]`.
//!
//! The tables trade a small accuracy loss for avoiding transcendental calls
//! in the hot path. Contract: table-driven sigmoid/tanh/GELU match the
//! analytic forms within `1e-3` absolute over the tabulated range; outside
//! the range the lookup clamps to the table endpoints.
//!
//! # Example Usage
//!
//! ```no_run
//! use infercore::tables::{tables, Activation};
//!
//! let y = Activation::Gelu.apply(0.5);
//! let y_fast = tables().gelu(0.5);
//! assert!((y - y_fast).abs() < 1e-3);
//! ```

use once_cell::sync::Lazy;

use crate::errors::{EngineError, EngineResult};

/// Lower bound of the tabulated range
pub const TABLE_MIN: f32 = -8.0;

/// Upper bound of the tabulated range
pub const TABLE_MAX: f32 = 8.0;

/// Table resolution (entries per function)
pub const TABLE_SIZE: usize = 1024;

/// Position-wise activation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Activation {
    None,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
}

impl Activation {
    /// Apply the analytic form to one value
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Gelu => gelu(x),
        }
    }

    /// Wire encoding used by the model file formats
    pub fn to_u32(self) -> u32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Sigmoid => 2,
            Activation::Tanh => 3,
            Activation::Gelu => 4,
        }
    }

    /// Decode from the wire encoding
    pub fn from_u32(v: u32) -> EngineResult<Self> {
        match v {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::Sigmoid),
            3 => Ok(Activation::Tanh),
            4 => Ok(Activation::Gelu),
            other => Err(EngineError::InvalidArgument {
                what: format!("activation id {}", other),
            }),
        }
    }
}

/// Logistic sigmoid
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// GELU, tanh approximation
///
/// ```text
/// GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
/// ```
#[inline]
pub fn gelu(x: f32) -> f32 {
    let sqrt_2_over_pi = (2.0 / std::f32::consts::PI).sqrt();
    let inner = sqrt_2_over_pi * (x + 0.044715 * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Precomputed activation tables over `[TABLE_MIN, TABLE_MAX]`
pub struct ActivationTables {
    sigmoid: Vec<f32>,
    tanh: Vec<f32>,
    gelu: Vec<f32>,
}

impl ActivationTables {
    fn build() -> Self {
        let mut sig = Vec::with_capacity(TABLE_SIZE);
        let mut tan = Vec::with_capacity(TABLE_SIZE);
        let mut gel = Vec::with_capacity(TABLE_SIZE);
        for i in 0..TABLE_SIZE {
            let x = TABLE_MIN + (TABLE_MAX - TABLE_MIN) * (i as f32) / (TABLE_SIZE - 1) as f32;
            sig.push(sigmoid(x));
            tan.push(x.tanh());
            gel.push(gelu(x));
        }
        Self {
            sigmoid: sig,
            tanh: tan,
            gelu: gel,
        }
    }

    /// Table-driven sigmoid
    #[inline]
    pub fn sigmoid(&self, x: f32) -> f32 {
        lookup(&self.sigmoid, x)
    }

    /// Table-driven tanh
    #[inline]
    pub fn tanh(&self, x: f32) -> f32 {
        lookup(&self.tanh, x)
    }

    /// Table-driven GELU
    #[inline]
    pub fn gelu(&self, x: f32) -> f32 {
        lookup(&self.gelu, x)
    }
}

/// Linear interpolation into a table; clamps outside the tabulated range
#[inline]
fn lookup(table: &[f32], x: f32) -> f32 {
    if x <= TABLE_MIN {
        return table[0];
    }
    if x >= TABLE_MAX {
        return table[TABLE_SIZE - 1];
    }
    let pos = (x - TABLE_MIN) / (TABLE_MAX - TABLE_MIN) * (TABLE_SIZE - 1) as f32;
    let idx = pos as usize;
    let frac = pos - idx as f32;
    table[idx] + (table[idx + 1] - table[idx]) * frac
}

static TABLES: Lazy<ActivationTables> = Lazy::new(ActivationTables::build);

/// Shared activation tables, built on first use
pub fn tables() -> &'static ActivationTables {
    &TABLES
}
