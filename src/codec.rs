use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TuneError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: u32,
    pub max: u32,
}

impl ResourceRange {
    pub fn new(min: u32, max: u32) -> Result<Self> {
        if min == 0 || min > max {
            return Err(TuneError::InvalidConfiguration(format!(
                "resource range [{}, {}] must satisfy 1 <= min <= max",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, resource: u32) -> bool {
        (self.min..=self.max).contains(&resource)
    }

    pub fn check(&self, resource: f64) -> Result<u32> {
        let out_of_range = TuneError::Range {
            resource,
            min: self.min,
            max: self.max,
        };
        if !resource.is_finite() || resource.fract() != 0. {
            return Err(out_of_range);
        }
        if resource < self.min as f64 || resource > self.max as f64 {
            return Err(out_of_range);
        }
        Ok(resource as u32)
    }

    pub fn normalize(&self, resource: f64) -> f64 {
        if self.max == self.min {
            return 0.;
        }
        (resource - self.min as f64) / (self.max - self.min) as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCodec {
    range: ResourceRange,
}

impl FeatureCodec {
    pub fn new(range: ResourceRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> ResourceRange {
        self.range
    }

    pub fn encode(&self, config: &[f64], resource: u32) -> Result<Vec<f64>> {
        self.range.check(resource as f64)?;
        let mut extended = Vec::with_capacity(config.len() + 1);
        extended.extend_from_slice(config);
        extended.push(resource as f64);
        Ok(extended)
    }

    pub fn decode(&self, extended: &[f64]) -> Result<(Vec<f64>, u32)> {
        let (resource, config) = extended.split_last().ok_or_else(|| {
            TuneError::InvalidConfiguration("cannot decode an empty feature vector".to_string())
        })?;
        let resource = self.range.check(*resource)?;
        Ok((config.to_vec(), resource))
    }

    pub fn encode_batch(&self, configs: ArrayView2<f64>, resource: u32) -> Result<Array2<f64>> {
        self.range.check(resource as f64)?;
        let column = Array2::from_elem((configs.nrows(), 1), resource as f64);
        ndarray::concatenate(Axis(1), &[configs.view(), column.view()])
            .map_err(|e| TuneError::InvalidConfiguration(e.to_string()))
    }

    pub fn decode_batch(&self, features: ArrayView2<f64>) -> Result<(Array2<f64>, Vec<u32>)> {
        let ncols = features.ncols();
        if ncols == 0 {
            return Err(TuneError::InvalidConfiguration(
                "cannot decode features without columns".to_string(),
            ));
        }
        let resources = features
            .column(ncols - 1)
            .iter()
            .map(|r| self.range.check(*r))
            .collect::<Result<Vec<_>>>()?;
        let configs = features.slice(ndarray::s![.., ..ncols - 1]).to_owned();
        Ok((configs, resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn codec() -> FeatureCodec {
        FeatureCodec::new(ResourceRange::new(1, 81).unwrap())
    }

    #[test]
    fn resource_is_appended_last() {
        let extended = codec().encode(&[0.25, 0.75], 9).unwrap();
        assert_eq!(extended, vec![0.25, 0.75, 9.]);
    }

    #[test]
    fn out_of_range_resource_is_rejected() {
        assert!(matches!(
            codec().encode(&[0.5], 82),
            Err(TuneError::Range { max: 81, .. })
        ));
        assert!(matches!(
            codec().encode(&[0.5], 0),
            Err(TuneError::Range { .. })
        ));
        assert!(matches!(
            codec().decode(&[0.5, 3.5]),
            Err(TuneError::Range { .. })
        ));
    }

    #[test]
    fn invalid_range_declaration() {
        assert!(ResourceRange::new(0, 10).is_err());
        assert!(ResourceRange::new(10, 3).is_err());
        assert!(ResourceRange::new(3, 3).is_ok());
    }

    #[test]
    fn batch_decoding_splits_resources() {
        let features = array![[0.1, 0.2, 1.], [0.3, 0.4, 27.]];
        let (configs, resources) = codec().decode_batch(features.view()).unwrap();
        assert_eq!(configs, array![[0.1, 0.2], [0.3, 0.4]]);
        assert_eq!(resources, vec![1, 27]);

        let encoded = codec().encode_batch(configs.view(), 3).unwrap();
        assert_eq!(encoded, array![[0.1, 0.2, 3.], [0.3, 0.4, 3.]]);
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            config in proptest::collection::vec(-1e6f64..1e6, 0..8),
            resource in 1u32..=81,
        ) {
            let codec = codec();
            let (decoded, r) = codec.decode(&codec.encode(&config, resource).unwrap()).unwrap();
            prop_assert_eq!(decoded, config);
            prop_assert_eq!(r, resource);
        }
    }
}
