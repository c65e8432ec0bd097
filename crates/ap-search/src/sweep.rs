//! Hyperparameter value generation: random sampling, grids and local
//! perturbation over declared parameter domains.

use rand::Rng;
use std::collections::BTreeMap;

use ap_types::{HyperparameterValue, Hyperparameters, ParamDomain, ParameterSet};

/// Draw one value uniformly (or log-uniformly) from `domain`.
pub fn sample_value<R: Rng + ?Sized>(domain: &ParamDomain, rng: &mut R) -> HyperparameterValue {
    match domain {
        ParamDomain::Discrete { options } => {
            let idx = rng.gen_range(0..options.len().max(1));
            HyperparameterValue::Discrete(options.get(idx).cloned().unwrap_or_default())
        }
        ParamDomain::Float {
            min,
            max,
            log_scale: true,
        } if *min > 0.0 => {
            let log_val: f64 = rng.gen_range(min.ln()..=max.ln());
            HyperparameterValue::Float(log_val.exp().clamp(*min, *max))
        }
        ParamDomain::Float { min, max, .. } => HyperparameterValue::Float(rng.gen_range(*min..=*max)),
        ParamDomain::Long {
            min,
            max,
            log_scale: true,
        } if *min > 0 => {
            let log_val: f64 = rng.gen_range((*min as f64).ln()..=(*max as f64).ln());
            HyperparameterValue::Long((log_val.exp().round() as i64).clamp(*min, *max))
        }
        ParamDomain::Long { min, max, .. } => HyperparameterValue::Long(rng.gen_range(*min..=*max)),
    }
}

/// Random value for every declared parameter.
pub fn sample_parameters<R: Rng + ?Sized>(params: &Hyperparameters, rng: &mut R) -> ParameterSet {
    params
        .iter()
        .map(|p| (p.name.clone(), sample_value(&p.domain, rng)))
        .collect()
}

/// Grid points for one dimension; continuous and wide integer ranges get
/// `steps` evenly spaced points (in log space when log-scaled).
pub fn grid_values(domain: &ParamDomain, steps: usize) -> Vec<HyperparameterValue> {
    let steps = steps.max(2);
    let spaced = |min: f64, max: f64, log_scale: bool| -> Vec<f64> {
        let (lo, hi) = if log_scale && min > 0.0 {
            (min.ln(), max.ln())
        } else {
            (min, max)
        };
        (0..steps)
            .map(|i| {
                let t = i as f64 / (steps - 1) as f64;
                let v = lo + t * (hi - lo);
                if log_scale && min > 0.0 {
                    v.exp().clamp(min, max)
                } else {
                    v
                }
            })
            .collect()
    };

    match domain {
        ParamDomain::Discrete { options } => options
            .iter()
            .map(|o| HyperparameterValue::Discrete(o.clone()))
            .collect(),
        ParamDomain::Float {
            min,
            max,
            log_scale,
        } => spaced(*min, *max, *log_scale)
            .into_iter()
            .map(HyperparameterValue::Float)
            .collect(),
        ParamDomain::Long { min, max, .. } if (max - min + 1) as usize <= steps => {
            (*min..=*max).map(HyperparameterValue::Long).collect()
        }
        ParamDomain::Long {
            min,
            max,
            log_scale,
        } => {
            let mut values: Vec<i64> = spaced(*min as f64, *max as f64, *log_scale)
                .into_iter()
                .map(|v| (v.round() as i64).clamp(*min, *max))
                .collect();
            values.dedup();
            values.into_iter().map(HyperparameterValue::Long).collect()
        }
    }
}

/// Cartesian product of every dimension's grid.
pub fn parameter_grid(params: &Hyperparameters, steps: usize) -> Vec<ParameterSet> {
    let mut combos: Vec<ParameterSet> = vec![BTreeMap::new()];
    for param in params.iter() {
        let axis = grid_values(&param.domain, steps);
        let mut next = Vec::with_capacity(combos.len() * axis.len());
        for existing in &combos {
            for value in &axis {
                let mut combo = existing.clone();
                combo.insert(param.name.clone(), value.clone());
                next.push(combo);
            }
        }
        combos = next;
    }
    combos
}

/// Move `value` a small random step within `domain`: ±10% of the range for
/// floats (log range when log-scaled), ±2 for integers, a fresh draw for
/// discrete options.
pub fn perturb_value<R: Rng + ?Sized>(
    domain: &ParamDomain,
    value: &HyperparameterValue,
    rng: &mut R,
) -> HyperparameterValue {
    match (domain, value) {
        (
            ParamDomain::Float {
                min,
                max,
                log_scale,
            },
            HyperparameterValue::Float(v),
        ) => {
            if *log_scale && *min > 0.0 && *v > 0.0 {
                let log_range = max.ln() - min.ln();
                let noise = rng.gen_range(-0.1..0.1) * log_range;
                HyperparameterValue::Float((v.ln() + noise).exp().clamp(*min, *max))
            } else {
                let noise = rng.gen_range(-0.1..0.1) * (max - min);
                HyperparameterValue::Float((v + noise).clamp(*min, *max))
            }
        }
        (ParamDomain::Long { min, max, .. }, HyperparameterValue::Long(v)) => {
            let delta: i64 = rng.gen_range(-2..=2);
            HyperparameterValue::Long((v + delta).clamp(*min, *max))
        }
        _ => sample_value(domain, rng),
    }
}

/// Perturb every parameter's current value (or default).
pub fn perturb_parameters<R: Rng + ?Sized>(params: &Hyperparameters, rng: &mut R) -> ParameterSet {
    params
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                perturb_value(&p.domain, p.processed_value(), rng),
            )
        })
        .collect()
}
