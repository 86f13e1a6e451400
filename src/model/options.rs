//! Simulation options and their content fingerprint.
//!
//! The engine treats options as opaque: it only needs equality and a stable
//! [`Identifier`] derived from the same equality rules. [`ParameterSet`] is the
//! concrete options type used by the command-line runner.

use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Options contract
// ---------------------------------------------------------------------------

/// Everything needed to run one simulation.
///
/// Implementations must keep `fingerprint` consistent with `==`: two values
/// that compare equal must write the same fingerprint, and values that differ
/// should not. Floating fields with a tolerance should go through
/// [`Fingerprinter::write_f64`] and compare with [`float_key`] so both sides
/// quantize identically.
pub trait Options: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn fingerprint(&self, fp: &mut Fingerprinter);
}

/// Content fingerprint of an [`Options`] value (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; 32]);

impl Identifier {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for logs and directory names.
    pub fn short(&self) -> String {
        self.to_string()[..8].to_string()
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", self.short())
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Compute the identifier of an options value.
pub fn identifier<O: Options>(options: &O) -> Identifier {
    let mut fp = Fingerprinter::new();
    options.fingerprint(&mut fp);
    fp.finish()
}

// ---------------------------------------------------------------------------
// Fingerprinter
// ---------------------------------------------------------------------------

/// Canonical key for a float compared under a tolerance.
///
/// With a positive tolerance the value is bucketed by `round(value / tolerance)`.
/// When there is no tolerance, or the bucket index would not be an exact
/// integer below 2^53, the exact bits are used instead, with `-0.0` folded
/// onto `0.0` and every NaN onto one canonical NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKey {
    Bucket(i64),
    Bits(u64),
}

const MAX_EXACT_BUCKET: f64 = 9_007_199_254_740_992.0;

pub fn float_key(value: f64, tolerance: f64) -> FloatKey {
    if tolerance > 0.0 && value.is_finite() {
        let bucket = (value / tolerance).round();
        if bucket.is_finite() && bucket.abs() < MAX_EXACT_BUCKET {
            return FloatKey::Bucket(bucket as i64);
        }
    }
    if value.is_nan() {
        FloatKey::Bits(f64::NAN.to_bits())
    } else if value == 0.0 {
        FloatKey::Bits(0.0_f64.to_bits())
    } else {
        FloatKey::Bits(value.to_bits())
    }
}

/// Streaming fingerprint builder handed to [`Options::fingerprint`].
///
/// Every write is tagged and length-prefixed so adjacent fields cannot run
/// together.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn tag(&mut self, tag: u8) {
        self.hasher.update([tag]);
    }

    /// Field name marker. Optional, but makes reordered structs hash apart.
    pub fn field(&mut self, name: &str) -> &mut Self {
        self.tag(b'k');
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.tag(b's');
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.tag(b'i');
        self.hasher.update(value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.tag(b'b');
        self.hasher.update([value as u8]);
        self
    }

    pub fn write_f64(&mut self, value: f64, tolerance: f64) -> &mut Self {
        match float_key(value, tolerance) {
            FloatKey::Bucket(bucket) => {
                self.tag(b'q');
                self.hasher.update(tolerance.to_bits().to_le_bytes());
                self.hasher.update(bucket.to_le_bytes());
            }
            FloatKey::Bits(bits) => {
                self.tag(b'f');
                self.hasher.update(bits.to_le_bytes());
            }
        }
        self
    }

    /// Fingerprint a collection whose order does not matter.
    ///
    /// Each item is hashed on its own; the sub-digests are sorted before being
    /// fed to this fingerprint.
    pub fn write_unordered<I, F>(&mut self, items: I, mut write: F) -> &mut Self
    where
        I: IntoIterator,
        F: FnMut(&mut Fingerprinter, I::Item),
    {
        let mut digests: Vec<[u8; 32]> = items
            .into_iter()
            .map(|item| {
                let mut sub = Fingerprinter::new();
                write(&mut sub, item);
                sub.finish().0
            })
            .collect();
        digests.sort_unstable();

        self.tag(b'u');
        self.hasher.update((digests.len() as u64).to_le_bytes());
        for digest in &digests {
            self.hasher.update(digest);
        }
        self
    }

    fn finish(self) -> Identifier {
        Identifier(self.hasher.finalize().into())
    }
}

// ---------------------------------------------------------------------------
// ParameterSet
// ---------------------------------------------------------------------------

/// One named simulation input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Unordered set of labels, e.g. detector names.
    Tags(Vec<String>),
    /// Float compared within `tolerance`.
    Measured { value: f64, tolerance: f64 },
}

impl Parameter {
    pub fn measured(value: f64, tolerance: f64) -> Self {
        Parameter::Measured { value, tolerance }
    }

    fn sorted_tags(tags: &[String]) -> Vec<&str> {
        let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
    }

    fn fingerprint(&self, fp: &mut Fingerprinter) {
        match self {
            Parameter::Bool(v) => {
                fp.write_bool(*v);
            }
            Parameter::Int(v) => {
                fp.write_i64(*v);
            }
            Parameter::Float(v) => {
                fp.write_f64(*v, 0.0);
            }
            Parameter::Text(v) => {
                fp.write_str(v);
            }
            Parameter::Tags(tags) => {
                fp.write_unordered(Self::sorted_tags(tags), |sub, tag| {
                    sub.write_str(tag);
                });
            }
            Parameter::Measured { value, tolerance } => {
                fp.write_f64(*tolerance, 0.0).write_f64(*value, *tolerance);
            }
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Parameter::Bool(a), Parameter::Bool(b)) => a == b,
            (Parameter::Int(a), Parameter::Int(b)) => a == b,
            (Parameter::Float(a), Parameter::Float(b)) => float_key(*a, 0.0) == float_key(*b, 0.0),
            (Parameter::Text(a), Parameter::Text(b)) => a == b,
            (Parameter::Tags(a), Parameter::Tags(b)) => {
                Self::sorted_tags(a) == Self::sorted_tags(b)
            }
            (
                Parameter::Measured {
                    value: a,
                    tolerance: ta,
                },
                Parameter::Measured {
                    value: b,
                    tolerance: tb,
                },
            ) => {
                float_key(*ta, 0.0) == float_key(*tb, 0.0)
                    && float_key(*a, *ta) == float_key(*b, *tb)
            }
            _ => false,
        }
    }
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::Bool(value)
    }
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::Int(value)
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Float(value)
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::Text(value.to_string())
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::Text(value)
    }
}

/// Options for one run of an external simulation program: the program to
/// drive, its arguments, and its named parameters. Argument order is part of
/// the identity; parameter order never is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Parameter>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }
}

impl Options for ParameterSet {
    fn fingerprint(&self, fp: &mut Fingerprinter) {
        fp.field("program").write_str(&self.program);
        fp.field("args").write_i64(self.args.len() as i64);
        for arg in &self.args {
            fp.write_str(arg);
        }
        fp.write_unordered(&self.parameters, |sub, (name, value)| {
            sub.field(name);
            value.fingerprint(sub);
        });
    }
}
