//! # Logical Qubit Model - Bounded Fault-Tolerant Qubit Abstraction
//!
//! A bounded, deterministic model of a fault-tolerant logical qubit. This is
//! deliberately *not* a general quantum simulator: it supports exactly the
//! operations the opcode catalogue needs, with semantics sufficient for unit
//! testing the engine and the firewall.
//!
//! ## 🔬 State Abstraction
//!
//! Each logical qubit carries a small discrete basis tag:
//!
//! - `Z0`, `Z1` — computational basis states
//! - `XPlus`, `XMinus` — Hadamard basis states
//! - `Unknown` — entered whenever the simplified model cannot justify a
//!   concrete classical basis (after entangling interactions, off-Clifford
//!   rotations, magic-state injection)
//!
//! Single-qubit Cliffords are deterministic transitions between the five
//! tags. Measuring a classical basis state in its own basis is deterministic;
//! measuring anything else draws a seeded pseudo-random bit and collapses the
//! state to the observed basis.
//!
//! ## Determinism
//!
//! Every source of nondeterminism — unknown-state measurement and error
//! injection — draws from a single ChaCha20 PRNG owned by the executing job
//! and seeded from the session job seed. Repeating a job with the same seed
//! reproduces every event value.

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Quantum error correction profile: an opaque code descriptor plus the one
/// number the substrate computes with
///
/// Formula evaluation for specific code families is an extension point and is
/// deliberately not inlined here; the resource manager only multiplies by
/// `physical_per_logical` and the error model only reads the cycle time and
/// physical error rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QecProfile {
    /// Code family, e.g. "surface"; not interpreted by the core
    pub code_family: String,
    /// Code distance; not interpreted by the core
    pub distance: u32,
    /// Physical qubits reserved per logical qubit
    pub physical_per_logical: usize,
    /// QEC cycle time estimate in microseconds
    pub cycle_time_us: f64,
    /// Physical per-cycle error rate
    pub physical_error_rate: f64,
}

impl Default for QecProfile {
    fn default() -> Self {
        Self {
            code_family: "surface".to_string(),
            distance: 3,
            physical_per_logical: 17,
            cycle_time_us: 1.0,
            physical_error_rate: 1e-3,
        }
    }
}

impl QecProfile {
    /// Per-operation logical error probability derived from the profile
    pub fn error_probability_per_op(&self) -> f64 {
        (self.physical_error_rate * self.cycle_time_us).clamp(0.0, 1.0)
    }
}

/// Discrete basis tag of a logical qubit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasisState {
    Z0,
    Z1,
    XPlus,
    XMinus,
    /// No concrete classical basis is justified by the simplified model
    Unknown,
}

/// Measurement basis for `MEASURE_Z` / `MEASURE_X`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementBasis {
    Z,
    X,
}

/// One fault-tolerant logical qubit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalQubit {
    /// Kernel-issued virtual qubit id
    pub id: String,
    /// Current basis tag
    pub basis: BasisState,
    /// QEC profile this qubit was allocated under
    pub profile: QecProfile,
    /// Accumulated injected-error count
    pub error_count: u64,
    /// T-count bookkeeping (T gates and magic-state injections)
    pub t_count: u64,
    /// Accumulated Z-rotation angle in radians (phase bookkeeping)
    pub rz_phase: f64,
    /// Unix seconds at allocation
    pub created_at: i64,
}

impl LogicalQubit {
    /// Fresh logical qubit in `Z0`
    pub fn new(id: impl Into<String>, profile: QecProfile) -> Self {
        Self {
            id: id.into(),
            basis: BasisState::Z0,
            profile,
            error_count: 0,
            t_count: 0,
            rz_phase: 0.0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Hadamard: swaps the Z and X bases
    pub fn apply_h(&mut self) {
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::XPlus,
            BasisState::Z1 => BasisState::XMinus,
            BasisState::XPlus => BasisState::Z0,
            BasisState::XMinus => BasisState::Z1,
            BasisState::Unknown => BasisState::Unknown,
        };
    }

    /// Pauli-X: flips the computational basis, fixes the X basis up to phase
    pub fn apply_x(&mut self) {
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z1,
            BasisState::Z1 => BasisState::Z0,
            other => other,
        };
    }

    /// Pauli-Y: flips both bases up to phase
    pub fn apply_y(&mut self) {
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z1,
            BasisState::Z1 => BasisState::Z0,
            BasisState::XPlus => BasisState::XMinus,
            BasisState::XMinus => BasisState::XPlus,
            BasisState::Unknown => BasisState::Unknown,
        };
    }

    /// Pauli-Z: flips the X basis, fixes the computational basis up to phase
    pub fn apply_z(&mut self) {
        self.basis = match self.basis {
            BasisState::XPlus => BasisState::XMinus,
            BasisState::XMinus => BasisState::XPlus,
            other => other,
        };
    }

    /// S gate: π/2 phase. Leaves the computational basis; takes the X basis
    /// off the tracked tags (|+⟩ → |+i⟩)
    pub fn apply_s(&mut self) {
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z0,
            BasisState::Z1 => BasisState::Z1,
            _ => BasisState::Unknown,
        };
    }

    /// T gate: π/4 phase, tracked in the T-count
    pub fn apply_t(&mut self) {
        self.t_count += 1;
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z0,
            BasisState::Z1 => BasisState::Z1,
            _ => BasisState::Unknown,
        };
    }

    /// Z-rotation by `theta` radians, tracked for phase bookkeeping
    ///
    /// Multiples of 2π are identity; odd multiples of π act like Z. Any other
    /// angle takes X-basis states off the tracked tags.
    pub fn apply_rz(&mut self, theta: f64) {
        self.rz_phase += theta;
        let turns = theta.rem_euclid(2.0 * std::f64::consts::PI);
        const EPS: f64 = 1e-9;
        if turns.abs() < EPS || (2.0 * std::f64::consts::PI - turns).abs() < EPS {
            return;
        }
        if (turns - std::f64::consts::PI).abs() < EPS {
            self.apply_z();
            return;
        }
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z0,
            BasisState::Z1 => BasisState::Z1,
            _ => BasisState::Unknown,
        };
    }

    /// Entangling interaction: the simplified model no longer justifies a
    /// classical basis for this operand
    pub fn entangling_touch(&mut self) {
        self.basis = BasisState::Unknown;
    }

    /// Magic-state injection enacting a fault-tolerant T gate
    pub fn inject_t_state(&mut self) {
        self.t_count += 1;
        self.basis = BasisState::Unknown;
    }

    /// Reset to `Z0`; error and T counters persist as bookkeeping
    pub fn reset(&mut self) {
        self.basis = BasisState::Z0;
        self.rz_phase = 0.0;
    }

    /// Measure in `basis`, collapsing to the observed state
    ///
    /// Classical basis states measured in their own basis are deterministic;
    /// everything else draws a bit from the job PRNG.
    pub fn measure(&mut self, basis: MeasurementBasis, rng: &mut ChaCha20Rng) -> u8 {
        let outcome = match (basis, self.basis) {
            (MeasurementBasis::Z, BasisState::Z0) => 0,
            (MeasurementBasis::Z, BasisState::Z1) => 1,
            (MeasurementBasis::X, BasisState::XPlus) => 0,
            (MeasurementBasis::X, BasisState::XMinus) => 1,
            _ => rng.gen_range(0..2u8),
        };
        self.basis = match (basis, outcome) {
            (MeasurementBasis::Z, 0) => BasisState::Z0,
            (MeasurementBasis::Z, _) => BasisState::Z1,
            (MeasurementBasis::X, 0) => BasisState::XPlus,
            (MeasurementBasis::X, _) => BasisState::XMinus,
        };
        outcome
    }

    /// Per-profile error injection after an operation
    ///
    /// With the profile-derived probability, flips the state within its basis
    /// and increments the error counter. Returns whether an error fired.
    pub fn inject_error(&mut self, rng: &mut ChaCha20Rng) -> bool {
        let p = self.profile.error_probability_per_op();
        if p <= 0.0 || rng.gen::<f64>() >= p {
            return false;
        }
        self.error_count += 1;
        self.basis = match self.basis {
            BasisState::Z0 => BasisState::Z1,
            BasisState::Z1 => BasisState::Z0,
            BasisState::XPlus => BasisState::XMinus,
            BasisState::XMinus => BasisState::XPlus,
            BasisState::Unknown => BasisState::Unknown,
        };
        true
    }
}
