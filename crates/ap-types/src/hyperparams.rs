//! Typed hyperparameter schema.
//!
//! Each learner declares its sweepable parameters up front; values are bound
//! onto the learner's options through explicit setter functions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{ApResult, SearchError};

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HyperparameterValue {
    Discrete(String),
    Float(f64),
    Long(i64),
}

impl HyperparameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Long(v) => Some(*v as f64),
            Self::Discrete(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Discrete(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for HyperparameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discrete(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
        }
    }
}

/// Describes the range a parameter is swept over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamDomain {
    /// Categorical options.
    Discrete { options: Vec<String> },
    /// Continuous range [min, max], optionally log-scaled.
    Float { min: f64, max: f64, log_scale: bool },
    /// Integer range [min, max] inclusive, optionally log-scaled.
    Long { min: i64, max: i64, log_scale: bool },
}

impl ParamDomain {
    /// Coerce `value` into this domain, or explain why it does not fit.
    pub fn coerce(&self, value: &HyperparameterValue) -> Result<HyperparameterValue, String> {
        match (self, value) {
            (Self::Discrete { options }, HyperparameterValue::Discrete(v)) => {
                if options.iter().any(|o| o == v) {
                    Ok(value.clone())
                } else {
                    Err(format!("{v} is not one of {options:?}"))
                }
            }
            (Self::Float { min, max, .. }, v) => match v.as_f64() {
                Some(x) if x >= *min && x <= *max => Ok(HyperparameterValue::Float(x)),
                Some(x) => Err(format!("{x} outside [{min}, {max}]")),
                None => Err(format!("expected a float, got {v}")),
            },
            (Self::Long { min, max, .. }, v) => match v.as_i64() {
                Some(x) if x >= *min && x <= *max => Ok(HyperparameterValue::Long(x)),
                Some(x) => Err(format!("{x} outside [{min}, {max}]")),
                None => Err(format!("expected an integer, got {v}")),
            },
            (Self::Discrete { .. }, v) => Err(format!("expected a discrete option, got {v}")),
        }
    }

    /// Number of grid points, `None` for continuous dimensions.
    pub fn grid_size(&self) -> Option<usize> {
        match self {
            Self::Discrete { options } => Some(options.len()),
            Self::Long { min, max, .. } => Some((max - min + 1).max(0) as usize),
            Self::Float { .. } => None,
        }
    }
}

/// A declared hyperparameter: name, domain, default and the current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepableParam {
    pub name: String,
    pub domain: ParamDomain,
    pub default: HyperparameterValue,
    pub value: Option<HyperparameterValue>,
}

impl SweepableParam {
    pub fn discrete(name: impl Into<String>, options: &[&str], default: &str) -> Self {
        Self {
            name: name.into(),
            domain: ParamDomain::Discrete {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            default: HyperparameterValue::Discrete(default.to_string()),
            value: None,
        }
    }

    pub fn float(name: impl Into<String>, min: f64, max: f64, default: f64) -> Self {
        Self {
            name: name.into(),
            domain: ParamDomain::Float {
                min,
                max,
                log_scale: false,
            },
            default: HyperparameterValue::Float(default),
            value: None,
        }
    }

    pub fn float_log(name: impl Into<String>, min: f64, max: f64, default: f64) -> Self {
        Self {
            name: name.into(),
            domain: ParamDomain::Float {
                min,
                max,
                log_scale: true,
            },
            default: HyperparameterValue::Float(default),
            value: None,
        }
    }

    pub fn long(name: impl Into<String>, min: i64, max: i64, default: i64) -> Self {
        Self {
            name: name.into(),
            domain: ParamDomain::Long {
                min,
                max,
                log_scale: false,
            },
            default: HyperparameterValue::Long(default),
            value: None,
        }
    }

    pub fn long_log(name: impl Into<String>, min: i64, max: i64, default: i64) -> Self {
        Self {
            name: name.into(),
            domain: ParamDomain::Long {
                min,
                max,
                log_scale: true,
            },
            default: HyperparameterValue::Long(default),
            value: None,
        }
    }

    /// The explicit value if set, otherwise the default.
    pub fn processed_value(&self) -> &HyperparameterValue {
        self.value.as_ref().unwrap_or(&self.default)
    }
}

/// Resolved name → value map handed to learner builders.
pub type ParameterSet = BTreeMap<String, HyperparameterValue>;

/// The ordered hyperparameter set of one learner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    params: Vec<SweepableParam>,
}

impl Hyperparameters {
    pub fn new(params: Vec<SweepableParam>) -> Self {
        Self { params }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SweepableParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SweepableParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Set one value after checking it against the declared domain.
    pub fn set(&mut self, name: &str, value: HyperparameterValue) -> ApResult<()> {
        let param = self
            .params
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| SearchError::InvalidHyperparameter {
                name: name.to_string(),
                message: "not declared by learner".to_string(),
            })?;
        let coerced = param
            .domain
            .coerce(&value)
            .map_err(|message| SearchError::InvalidHyperparameter {
                name: name.to_string(),
                message,
            })?;
        param.value = Some(coerced);
        Ok(())
    }

    /// Set every value in `values`.
    pub fn apply(&mut self, values: &ParameterSet) -> ApResult<()> {
        for (name, value) in values {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Clear explicit values so defaults apply again.
    pub fn reset(&mut self) {
        for param in &mut self.params {
            param.value = None;
        }
    }

    /// Value (or default) for every declared parameter.
    pub fn resolved(&self) -> ParameterSet {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.processed_value().clone()))
            .collect()
    }
}

impl fmt::Display for Hyperparameters {
    /// Only explicitly set values are listed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<String> = self
            .params
            .iter()
            .filter_map(|p| p.value.as_ref().map(|v| format!("{}:{v}", p.name)))
            .collect();
        write!(f, "{{{}}}", set.join(", "))
    }
}

/// Setter used to write one hyperparameter onto a learner's options.
pub type ParamSetter<O> = fn(&mut O, &HyperparameterValue) -> Result<(), String>;

/// Binds a declared parameter to the field of an options struct.
pub struct ParamBinding<O> {
    pub param: SweepableParam,
    pub setter: ParamSetter<O>,
}

impl<O> ParamBinding<O> {
    pub fn new(param: SweepableParam, setter: ParamSetter<O>) -> Self {
        Self { param, setter }
    }
}

impl<O> fmt::Debug for ParamBinding<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamBinding")
            .field("param", &self.param.name)
            .finish()
    }
}

/// Write resolved values onto `options` through the bindings. Names without a
/// binding are rejected.
pub fn bind_parameters<O>(
    options: &mut O,
    bindings: &[ParamBinding<O>],
    values: &ParameterSet,
) -> ApResult<()> {
    for (name, value) in values {
        let binding = bindings
            .iter()
            .find(|b| &b.param.name == name)
            .ok_or_else(|| SearchError::InvalidHyperparameter {
                name: name.clone(),
                message: "no binding".to_string(),
            })?;
        let value = binding
            .param
            .domain
            .coerce(value)
            .map_err(|message| SearchError::InvalidHyperparameter {
                name: name.clone(),
                message,
            })?;
        (binding.setter)(options, &value).map_err(|message| {
            SearchError::InvalidHyperparameter {
                name: name.clone(),
                message,
            }
        })?;
    }
    Ok(())
}
