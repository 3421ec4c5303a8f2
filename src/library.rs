use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};

use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TuneError};

#[derive(Clone, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i32),
    Float(f64),
    Categorical(String),
}

impl Value {
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Categorical(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Categorical(value.to_string())
    }
}

pub type Configuration = BTreeMap<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "type", content = "range")]
pub enum Domain {
    Discrete(RangeInclusive<i32>),
    Continuous(Range<f64>),
    LogContinuous(Range<f64>),
    Categorical(Vec<String>),
}

impl Domain {
    pub(crate) fn random_value(&self, r: &mut impl Rng) -> Value {
        match self {
            Domain::Continuous(range) => Value::Float(r.gen_range(range.clone())),
            Domain::LogContinuous(range) => {
                let log_value = r.gen_range(range.start.ln()..range.end.ln());
                Value::Float(log_value.exp())
            }
            Domain::Discrete(range) => Value::Integer(r.gen_range(range.clone())),
            Domain::Categorical(choices) => {
                Value::Categorical(choices[r.gen_range(0..choices.len())].clone())
            }
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Domain::Categorical(choices) => choices.len(),
            _ => 1,
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        let valid = match self {
            Domain::Continuous(range) => {
                range.start.is_finite() && range.end.is_finite() && range.start < range.end
            }
            Domain::LogContinuous(range) => {
                range.start > 0. && range.end.is_finite() && range.start < range.end
            }
            Domain::Discrete(range) => range.start() <= range.end(),
            Domain::Categorical(choices) => !choices.is_empty(),
        };
        if valid {
            Ok(())
        } else {
            Err(TuneError::InvalidConfiguration(format!(
                "domain {:?} of {} is empty or not representable",
                self, name
            )))
        }
    }

    fn encode_into(&self, name: &str, value: &Value, out: &mut Vec<f64>) -> Result<()> {
        let mismatch = || {
            TuneError::InvalidConfiguration(format!(
                "value {:?} does not belong to the domain of {}",
                value, name
            ))
        };
        match (self, value) {
            (Domain::Continuous(range), _) => {
                let v = value.to_f64().ok_or_else(mismatch)?;
                out.push(unit_interval(v, range.start, range.end));
            }
            (Domain::LogContinuous(range), _) => {
                let v = value.to_f64().ok_or_else(mismatch)?;
                if v <= 0. {
                    return Err(mismatch());
                }
                out.push(unit_interval(v.ln(), range.start.ln(), range.end.ln()));
            }
            (Domain::Discrete(range), Value::Integer(v)) => {
                if !range.contains(v) {
                    return Err(mismatch());
                }
                let size = (range.end() - range.start() + 1) as f64;
                out.push((*v - range.start()) as f64 / size + 0.5 / size);
            }
            (Domain::Categorical(choices), Value::Categorical(choice)) => {
                let index = choices
                    .iter()
                    .position(|c| c == choice)
                    .ok_or_else(mismatch)?;
                out.extend((0..choices.len()).map(|i| if i == index { 1. } else { 0. }));
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    fn decode(&self, encoded: &[f64]) -> Value {
        match self {
            Domain::Continuous(range) => {
                let u = encoded[0].clamp(0., 1.);
                Value::Float(range.start + u * (range.end - range.start))
            }
            Domain::LogContinuous(range) => {
                let u = encoded[0].clamp(0., 1.);
                let (low, high) = (range.start.ln(), range.end.ln());
                Value::Float((low + u * (high - low)).exp())
            }
            Domain::Discrete(range) => {
                let size = range.end() - range.start() + 1;
                let offset = (encoded[0].clamp(0., 1.) * size as f64).floor() as i32;
                Value::Integer(range.start() + offset.min(size - 1))
            }
            Domain::Categorical(choices) => {
                let index = encoded
                    .iter()
                    .position_max_by(|a, b| a.total_cmp(b))
                    .unwrap_or(0);
                Value::Categorical(choices[index].clone())
            }
        }
    }
}

#[inline]
fn unit_interval(value: f64, start: f64, end: f64) -> f64 {
    let size = end - start;
    if size <= 0. {
        return 0.;
    }
    ((value - start) / size).clamp(0., 1.)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpace {
    domains: Vec<Domain>,
    names: Vec<String>,
}

impl ConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f64_range(self, range: Range<f64>, name: impl Into<String>) -> Self {
        self.add(Domain::Continuous(range), name)
    }

    pub fn add_log_f64_range(self, range: Range<f64>, name: impl Into<String>) -> Self {
        self.add(Domain::LogContinuous(range), name)
    }

    pub fn add_i32_range(self, range: RangeInclusive<i32>, name: impl Into<String>) -> Self {
        self.add(Domain::Discrete(range), name)
    }

    pub fn add_choice<S: Into<String>>(
        self,
        choices: impl IntoIterator<Item = S>,
        name: impl Into<String>,
    ) -> Self {
        self.add(
            Domain::Categorical(choices.into_iter().map(Into::into).collect()),
            name,
        )
    }

    fn add(mut self, domain: Domain, name: impl Into<String>) -> Self {
        self.domains.push(domain);
        self.names.push(name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Domain)> {
        self.names.iter().zip(self.domains.iter())
    }

    pub fn encoded_dim(&self) -> usize {
        self.domains.iter().map(Domain::encoded_size).sum()
    }

    pub fn encoded_bounds(&self) -> Vec<(f64, f64)> {
        vec![(0., 1.); self.encoded_dim()]
    }

    pub fn encode(&self, config: &Configuration) -> Result<Vec<f64>> {
        let mut encoded = Vec::with_capacity(self.encoded_dim());
        for (name, domain) in self.iter() {
            let value = config.get(name).ok_or_else(|| {
                TuneError::InvalidConfiguration(format!("missing hyperparameter {}", name))
            })?;
            domain.encode_into(name, value, &mut encoded)?;
        }
        Ok(encoded)
    }

    /// Rejects empty ranges, log ranges touching zero, choice lists without
    /// choices and repeated names.
    pub fn validate_domains(&self) -> Result<()> {
        if let Some(name) = self.names.iter().duplicates().next() {
            return Err(TuneError::InvalidConfiguration(format!(
                "hyperparameter {} is declared twice",
                name
            )));
        }
        self.iter().try_for_each(|(name, domain)| domain.check(name))
    }

    pub fn decode(&self, encoded: &[f64]) -> Result<Configuration> {
        self.validate_domains()?;
        if encoded.len() != self.encoded_dim() {
            return Err(TuneError::InvalidConfiguration(format!(
                "expected an encoded vector of size {}, received {}",
                self.encoded_dim(),
                encoded.len()
            )));
        }
        let mut offset = 0;
        let mut config = Configuration::new();
        for (name, domain) in self.iter() {
            let size = domain.encoded_size();
            config.insert(name.clone(), domain.decode(&encoded[offset..offset + size]));
            offset += size;
        }
        Ok(config)
    }

    pub fn random_configuration(&self, rng: &mut impl Rng) -> Configuration {
        self.iter()
            .map(|(name, domain)| (name.clone(), domain.random_value(rng)))
            .collect()
    }

    pub fn validate(&self, config: &Configuration) -> Result<()> {
        self.encode(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn space() -> ConfigSpace {
        ConfigSpace::new()
            .add_log_f64_range(1e-4..1e-1, "lr")
            .add_i32_range(16..=256, "batch_size")
            .add_choice(["adam", "sgd", "rmsprop"], "optimizer")
            .add_f64_range(0.0..0.5, "dropout")
    }

    #[test]
    fn encoded_dim_counts_one_hot_columns() {
        assert_eq!(space().encoded_dim(), 6);
        assert_eq!(space().len(), 4);
    }

    #[test]
    fn discrete_and_categorical_values_survive_encoding() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let config = space.random_configuration(&mut rng);
            let decoded = space.decode(&space.encode(&config).unwrap()).unwrap();
            assert_eq!(decoded["batch_size"], config["batch_size"]);
            assert_eq!(decoded["optimizer"], config["optimizer"]);
            let lr = decoded["lr"].to_f64().unwrap();
            assert!((lr - config["lr"].to_f64().unwrap()).abs() < 1e-12);
        }
    }

    #[test]
    fn encoding_lies_in_unit_cube() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(11);
        let config = space.random_configuration(&mut rng);
        assert!(space
            .encode(&config)
            .unwrap()
            .iter()
            .all(|u| (0. ..=1.).contains(u)));
    }

    #[test]
    fn degenerate_domains_are_rejected() {
        assert!(space().validate_domains().is_ok());
        let (low, high) = (4, 2);
        let invalid = [
            ConfigSpace::new().add_f64_range(0.5..0.5, "x"),
            ConfigSpace::new().add_f64_range(0.0..f64::INFINITY, "x"),
            ConfigSpace::new().add_log_f64_range(0.0..1.0, "lr"),
            ConfigSpace::new().add_log_f64_range(-1.0..1.0, "lr"),
            ConfigSpace::new().add_choice(Vec::<String>::new(), "optimizer"),
            ConfigSpace::new().add_i32_range(low..=high, "depth"),
            ConfigSpace::new()
                .add_f64_range(0.0..1.0, "x")
                .add_i32_range(0..=3, "x"),
        ];
        for space in invalid {
            assert!(matches!(
                space.validate_domains(),
                Err(TuneError::InvalidConfiguration(_))
            ));
            assert!(space.decode(&vec![0.5; space.encoded_dim()]).is_err());
        }
    }

    #[test]
    fn missing_or_mistyped_values_are_rejected() {
        let space = space();
        let mut config = space.random_configuration(&mut StdRng::seed_from_u64(1));
        config.insert("optimizer".to_string(), Value::from("lbfgs"));
        assert!(matches!(
            space.encode(&config),
            Err(TuneError::InvalidConfiguration(_))
        ));
        config.remove("optimizer");
        assert!(space.validate(&config).is_err());
    }
}
