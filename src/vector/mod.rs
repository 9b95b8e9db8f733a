//! Pin declarations, the tagged `Vector` sum type, and the `VectorBuilder`
//! that mints vectors from a running pin-state snapshot.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors raised while declaring pins, mutating pin state, or shaping
/// vectors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VectorError {
    #[error("unknown pin {0:?}")]
    UnknownPin(String),

    #[error("invalid pin state {0:?}; expected one of 0 1 X Z L H")]
    InvalidState(char),

    #[error("shape error: {0}")]
    ShapeError(String),
}

/// Direction of a declared pin, from the tester's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

/// A single declared pin: its physical name, default state, and direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinDecl {
    pub physical_name: String,
    pub default_state: char,
    pub direction: PinDirection,
}

fn validate_state(c: char) -> Result<char, VectorError> {
    match c {
        '0' | '1' | 'X' | 'Z' | 'L' | 'H' => Ok(c),
        other => Err(VectorError::InvalidState(other)),
    }
}

/// One application of a fixed pin state, held for `repeat` tester cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalVector {
    /// Logical pin name -> state character, one entry per declared pin.
    pub pin_state: BTreeMap<String, char>,
    pub repeat: u32,
    pub comment: Option<String>,
}

/// A sequencer loop: `body` replayed `repeat` times. May not contain a
/// `MatchedLoop` anywhere in its body, directly or nested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopVector {
    pub body: Vec<Vector>,
    pub repeat: u32,
}

/// A sequencer matched loop: apply `condition`, and if it fails, apply
/// `idle` and retry, up to `retries` times. Both sides must have a length
/// that is a positive multiple of 8. Matched loops cannot nest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedLoopVector {
    pub condition: Vec<NormalVector>,
    pub idle: Vec<NormalVector>,
    pub retries: u32,
}

/// A single emitted vector: one of three mutually exclusive shapes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vector {
    Normal(NormalVector),
    Loop(LoopVector),
    MatchedLoop(MatchedLoopVector),
}

fn contains_matched_loop(vectors: &[Vector]) -> bool {
    vectors.iter().any(|v| match v {
        Vector::MatchedLoop(_) => true,
        Vector::Loop(l) => contains_matched_loop(&l.body),
        Vector::Normal(_) => false,
    })
}

/// Tracks the "current" per-pin state and mints vectors from snapshots of
/// it. Owned by the generating pipeline; not shared across chip targets.
pub struct VectorBuilder {
    pins: BTreeMap<String, PinDecl>,
    physical_to_logical: BTreeMap<String, String>,
    state: BTreeMap<String, char>,
}

impl VectorBuilder {
    /// Declare the pin set and initialize every pin to its default state.
    pub fn new(pins: BTreeMap<String, PinDecl>) -> Self {
        let physical_to_logical = pins
            .iter()
            .map(|(logical, decl)| (decl.physical_name.clone(), logical.clone()))
            .collect();
        let state = pins
            .iter()
            .map(|(logical, decl)| (logical.clone(), decl.default_state))
            .collect();
        Self {
            pins,
            physical_to_logical,
            state,
        }
    }

    /// Reset every pin to its declared default.
    pub fn init(&mut self) {
        for (logical, decl) in &self.pins {
            self.state.insert(logical.clone(), decl.default_state);
        }
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if self.pins.contains_key(name) {
            Some(name.to_string())
        } else {
            self.physical_to_logical.get(name).cloned()
        }
    }

    /// Assign a single pin (by logical or physical name) to a state
    /// character from the legal alphabet.
    pub fn set(&mut self, pin: &str, value: char) -> Result<(), VectorError> {
        let value = validate_state(value)?;
        let logical = self
            .resolve(pin)
            .ok_or_else(|| VectorError::UnknownPin(pin.to_string()))?;
        self.state.insert(logical, value);
        Ok(())
    }

    /// Read back the current state of a pin (logical or physical name).
    pub fn get(&self, pin: &str) -> Result<char, VectorError> {
        let logical = self
            .resolve(pin)
            .ok_or_else(|| VectorError::UnknownPin(pin.to_string()))?;
        Ok(self.state[&logical])
    }

    /// Declared pins, in alphabetical-by-logical-name order.
    pub fn pins(&self) -> &BTreeMap<String, PinDecl> {
        &self.pins
    }

    /// Snapshot the current pin state into a `NormalVector`. The snapshot
    /// is a deep copy: later mutation of the builder never affects an
    /// already-emitted vector.
    pub fn vector(&self, repeat: u32, comment: Option<String>) -> NormalVector {
        NormalVector {
            pin_state: self.state.clone(),
            repeat: repeat.max(1),
            comment,
        }
    }

    /// Wrap `body` in a `LoopVector`, rejecting a body that contains a
    /// matched loop anywhere (nesting matched loops inside loops is
    /// undefined on the ATE sequencer).
    pub fn loop_(&self, body: Vec<Vector>, repeat: u32) -> Result<Vector, VectorError> {
        if repeat == 0 {
            return Err(VectorError::ShapeError(
                "loop repeat must be >= 1".to_string(),
            ));
        }
        if contains_matched_loop(&body) {
            return Err(VectorError::ShapeError(
                "matched loops cannot nest inside a loop".to_string(),
            ));
        }
        Ok(Vector::Loop(LoopVector { body, repeat }))
    }

    /// Assemble a `MatchedLoopVector`, enforcing the 8-vector shape rule on
    /// both sides.
    pub fn matched_loop(
        &self,
        condition: Vec<NormalVector>,
        idle: Vec<NormalVector>,
        retries: u32,
    ) -> Result<Vector, VectorError> {
        if condition.is_empty() || condition.len() % 8 != 0 {
            return Err(VectorError::ShapeError(format!(
                "matched loop condition length {} is not a positive multiple of 8",
                condition.len()
            )));
        }
        if idle.is_empty() || idle.len() % 8 != 0 {
            return Err(VectorError::ShapeError(format!(
                "matched loop idle length {} is not a positive multiple of 8",
                idle.len()
            )));
        }
        if retries == 0 {
            return Err(VectorError::ShapeError(
                "matched loop retries must be >= 1".to_string(),
            ));
        }
        Ok(Vector::MatchedLoop(MatchedLoopVector {
            condition,
            idle,
            retries,
        }))
    }

    /// Append copies of `padding` until the sequence length is a multiple
    /// of 8. A sequence that is already a multiple of 8 still gets 8 more
    /// copies: callers depend on at least one pad being present.
    pub fn pad(mut vectors: Vec<NormalVector>, padding: &NormalVector) -> Vec<NormalVector> {
        let deficit = (8 - vectors.len() % 8) % 8;
        let count = if deficit == 0 { 8 } else { deficit };
        vectors.extend(std::iter::repeat(padding.clone()).take(count));
        vectors
    }

    /// Fold adjacent `NormalVector`s with equal `pin_state` and `comment`
    /// by summing `repeat`. Recurses into loop bodies; matched loops are
    /// left untouched. Order-preserving and idempotent.
    pub fn compress(vectors: Vec<Vector>) -> Vec<Vector> {
        let mut out: Vec<Vector> = Vec::with_capacity(vectors.len());
        for v in vectors {
            let v = match v {
                Vector::Loop(l) => Vector::Loop(LoopVector {
                    body: Self::compress(l.body),
                    repeat: l.repeat,
                }),
                other => other,
            };
            match (&v, out.last_mut()) {
                (Vector::Normal(n), Some(Vector::Normal(prev)))
                    if prev.pin_state == n.pin_state && prev.comment == n.comment =>
                {
                    prev.repeat += n.repeat;
                }
                _ => out.push(v),
            }
        }
        out
    }
}
