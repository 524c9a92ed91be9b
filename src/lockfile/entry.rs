//! Lockfile keys and entries
//!
//! A resolution is keyed by `(module, function, inputs)`. Inputs are an
//! ordered tuple of JSON primitives so that every dimension that changes
//! the output (image platform, git ref, ...) is part of the key.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Module that owns the built-in resolver functions
pub const CORE_MODULE: &str = "core";
/// Image reference -> manifest digest
pub const CONTAINER_FROM: &str = "container.from";
/// URL -> content digest
pub const HTTP_GET: &str = "http.get";
/// Prefix for git operations (`git.branch`, `git.tag`, `git.commit`, ...)
pub const GIT_PREFIX: &str = "git.";

/// A single primitive input value
#[derive(Debug, Clone)]
pub enum Primitive {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Primitive {
    /// Convert a JSON value, rejecting arrays and objects
    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else {
                    n.as_f64()
                        .map(Self::Float)
                        .ok_or_else(|| format!("unrepresentable number {}", n))
                }
            }
            Value::String(s) => Ok(Self::String(s.clone())),
            Value::Array(_) => Err("inputs must be primitives, found array".to_string()),
            Value::Object(_) => Err("inputs must be primitives, found object".to_string()),
        }
    }

    /// False only for NaN and infinite floats, which have no JSON form
    pub fn is_encodable(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            _ => true,
        }
    }

    /// JSON form used on disk. A non-finite float renders as `null`; the
    /// lockfile refuses to record one.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::String(_) => 3,
        }
    }
}

impl Ord for Primitive {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            // Mixed numbers compare by value, ints first on a tie
            (Self::Int(a), Self::Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Self::Float(a), Self::Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for Primitive {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Primitive {}

impl Serialize for Primitive {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Primitive {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Primitive {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Primitive {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl TryFrom<f64> for Primitive {
    type Error = String;

    fn try_from(f: f64) -> Result<Self, Self::Error> {
        if f.is_finite() {
            Ok(Self::Float(f))
        } else {
            Err(format!("{} cannot be a lockfile input", f))
        }
    }
}

/// The unique key of a lockfile entry.
///
/// Field order matters: the derived `Ord` sorts by module, then function,
/// then inputs element-wise, which is the on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ResolverCall {
    pub module: String,
    pub function: String,
    pub inputs: Vec<Primitive>,
}

impl ResolverCall {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        inputs: impl IntoIterator<Item = Primitive>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            inputs: inputs.into_iter().collect(),
        }
    }

    /// `container.from` pinned per platform
    pub fn container_from(image_ref: &str, platform: &str) -> Self {
        Self::new(
            CORE_MODULE,
            CONTAINER_FROM,
            [Primitive::from(image_ref), Primitive::from(platform)],
        )
    }

    /// `http.get` for a URL
    pub fn http_get(url: &str) -> Self {
        Self::new(CORE_MODULE, HTTP_GET, [Primitive::from(url)])
    }

    /// `git.<op>` over a repository and ref, plus any op-specific inputs
    pub fn git(op: &str, repo: &str, git_ref: &str, extra: Vec<Primitive>) -> Self {
        let mut inputs = vec![Primitive::from(repo), Primitive::from(git_ref)];
        inputs.extend(extra);
        Self::new(CORE_MODULE, format!("{}{}", GIT_PREFIX, op), inputs)
    }

    /// Reject inputs that would not survive a write and reload unchanged
    pub fn check_inputs(&self) -> Result<(), String> {
        match self.inputs.iter().find(|i| !i.is_encodable()) {
            Some(input) => Err(format!("{:?} cannot be a lockfile input", input)),
            None => Ok(()),
        }
    }

    /// True for the built-in git resolvers
    pub fn is_git(&self) -> bool {
        self.module == CORE_MODULE && self.function.starts_with(GIT_PREFIX)
    }
}

impl fmt::Display for ResolverCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(|i| i.to_string()).collect();
        write!(f, "{}.{}({})", self.module, self.function, inputs.join(", "))
    }
}

/// A pinned resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockfileEntry {
    pub module: String,
    pub function: String,
    pub inputs: Vec<Primitive>,
    pub output: String,
}

impl LockfileEntry {
    pub fn new(call: ResolverCall, output: impl Into<String>) -> Self {
        Self {
            module: call.module,
            function: call.function,
            inputs: call.inputs,
            output: output.into(),
        }
    }

    pub fn call(&self) -> ResolverCall {
        ResolverCall {
            module: self.module.clone(),
            function: self.function.clone(),
            inputs: self.inputs.clone(),
        }
    }

    /// Encode as the compact on-disk line `[module, function, [inputs...], output]`
    pub fn encode_line(&self) -> String {
        let inputs: Vec<Value> = self.inputs.iter().map(Primitive::to_json).collect();
        Value::Array(vec![
            Value::String(self.module.clone()),
            Value::String(self.function.clone()),
            Value::Array(inputs),
            Value::String(self.output.clone()),
        ])
        .to_string()
    }

    /// Decode one on-disk line
    pub fn decode_line(line: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
        let Value::Array(items) = value else {
            return Err("entry must be a JSON array".to_string());
        };
        if items.len() != 4 {
            return Err(format!("expected 4 elements, found {}", items.len()));
        }

        let field = |idx: usize, name: &str| -> Result<String, String> {
            items[idx]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{} must be a string", name))
        };

        let module = field(0, "module")?;
        let function = field(1, "function")?;
        let output = field(3, "output")?;
        let inputs = items[2]
            .as_array()
            .ok_or_else(|| "inputs must be an array".to_string())?
            .iter()
            .map(Primitive::from_json)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            module,
            function,
            inputs,
            output,
        })
    }
}
