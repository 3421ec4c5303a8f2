use std::f64::consts::{PI, SQRT_2};
use std::fmt::Debug;

use ndarray::ArrayView1;

use crate::config::AcquisitionKind;
use crate::model::HeadGradients;

pub trait AcquisitionFunction: Send + Sync + Debug {
    fn value(&self, means: ArrayView1<f64>, std: f64) -> f64;

    fn head_gradients(&self, means: ArrayView1<f64>, std: f64) -> HeadGradients;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LowerConfidenceBound {
    pub kappa: f64,
}

impl AcquisitionFunction for LowerConfidenceBound {
    fn value(&self, means: ArrayView1<f64>, std: f64) -> f64 {
        means.mean().unwrap_or(0.) - self.kappa * std
    }

    fn head_gradients(&self, means: ArrayView1<f64>, _std: f64) -> HeadGradients {
        let m = means.len().max(1) as f64;
        HeadGradients {
            mean: vec![1. / m; means.len()],
            std: vec![-self.kappa],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpectedImprovement {
    pub incumbent: f64,
    pub jitter: f64,
}

impl ExpectedImprovement {
    fn single(&self, mean: f64, std: f64) -> (f64, f64, f64) {
        let gap = self.incumbent - self.jitter - mean;
        if std <= 0. {
            return if gap > 0. { (gap, -1., 0.) } else { (0., 0., 0.) };
        }
        let z = gap / std;
        let (cdf, pdf) = (normal_cdf(z), normal_pdf(z));
        (gap * cdf + std * pdf, -cdf, pdf)
    }
}

impl AcquisitionFunction for ExpectedImprovement {
    fn value(&self, means: ArrayView1<f64>, std: f64) -> f64 {
        let m = means.len().max(1) as f64;
        -means.iter().map(|mean| self.single(*mean, std).0).sum::<f64>() / m
    }

    fn head_gradients(&self, means: ArrayView1<f64>, std: f64) -> HeadGradients {
        let m = means.len().max(1) as f64;
        let mut gradients = HeadGradients {
            mean: Vec::with_capacity(means.len()),
            std: vec![0.],
        };
        for mean in means.iter() {
            let (_, d_mean, d_std) = self.single(*mean, std);
            gradients.mean.push(-d_mean / m);
            gradients.std[0] -= d_std / m;
        }
        gradients
    }
}

pub fn acquisition_function(
    kind: &AcquisitionKind,
    incumbent: f64,
    exploration: f64,
) -> Box<dyn AcquisitionFunction> {
    match *kind {
        AcquisitionKind::LowerConfidenceBound { kappa } => Box::new(LowerConfidenceBound {
            kappa: kappa * exploration,
        }),
        AcquisitionKind::ExpectedImprovement { jitter } => Box::new(ExpectedImprovement {
            incumbent,
            jitter: jitter + 0.01 * (exploration - 1.).max(0.),
        }),
    }
}

fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0. { -1. } else { 1. };
    let x = x.abs();
    let t = 1. / (1. + p * x);
    let y = 1. - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * (1. + erf(x / SQRT_2))
}

pub(crate) fn normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2. * PI).sqrt()
}

pub trait AcquisitionOptimizer: Send + Sync + Debug {
    fn minimize(&self, objective: &(dyn Fn(&[f64]) -> f64 + Sync), bounds: &[(f64, f64)]) -> (f64, Vec<f64>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimplersOptimizer {
    pub iterations: usize,
}

impl AcquisitionOptimizer for SimplersOptimizer {
    fn minimize(&self, objective: &(dyn Fn(&[f64]) -> f64 + Sync), bounds: &[(f64, f64)]) -> (f64, Vec<f64>) {
        let function = |input: &[f64]| objective(input);
        let (value, best) =
            simplers_optimization::Optimizer::minimize(&function, bounds, self.iterations);
        (value, best.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn lcb_prefers_uncertain_points() {
        let lcb = LowerConfidenceBound { kappa: 2. };
        let means = array![0.5, 0.7];
        assert!((lcb.value(means.view(), 0.1) - 0.4).abs() < 1e-12);
        assert!(lcb.value(means.view(), 0.5) < lcb.value(means.view(), 0.1));
        let head = lcb.head_gradients(means.view(), 0.1);
        assert_eq!(head.mean, vec![0.5, 0.5]);
        assert_eq!(head.std, vec![-2.]);
    }

    #[test]
    fn normal_cdf_is_accurate() {
        assert!((normal_cdf(0.) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.) - 0.158655).abs() < 1e-5);
    }

    #[test]
    fn expected_improvement_gradients_match_finite_differences() {
        let ei = ExpectedImprovement {
            incumbent: 0.2,
            jitter: 0.,
        };
        let means = array![0.1, 0.4];
        let std = 0.3;
        let head = ei.head_gradients(means.view(), std);
        let h = 1e-6;
        for i in 0..2 {
            let mut shifted = means.clone();
            shifted[i] += h;
            let fd = (ei.value(shifted.view(), std) - ei.value(means.view(), std)) / h;
            assert!((fd - head.mean[i]).abs() < 1e-4);
        }
        let fd = (ei.value(means.view(), std + h) - ei.value(means.view(), std)) / h;
        assert!((fd - head.std[0]).abs() < 1e-4);
        assert!(ei.value(means.view(), std) < 0.);
    }

    #[test]
    fn deterministic_expected_improvement() {
        let ei = ExpectedImprovement {
            incumbent: 1.,
            jitter: 0.,
        };
        assert_eq!(ei.value(array![0.25].view(), 0.), -0.75);
        assert_eq!(ei.value(array![2.].view(), 0.), 0.);
    }

    #[test]
    fn exploration_widens_the_bound() {
        let kind = AcquisitionKind::LowerConfidenceBound { kappa: 2. };
        let plain = acquisition_function(&kind, 0., 1.);
        let wide = acquisition_function(&kind, 0., 1.5);
        let means = array![0.];
        assert!((wide.value(means.view(), 1.) + 3.).abs() < 1e-12);
        assert!((plain.value(means.view(), 1.) + 2.).abs() < 1e-12);
    }

    #[test]
    fn simplers_finds_the_minimum_of_a_bowl() {
        let optimizer = SimplersOptimizer { iterations: 300 };
        let bowl = |x: &[f64]| (x[0] - 0.3).powi(2) + (x[1] - 0.7).powi(2);
        let (value, best) = optimizer.minimize(&bowl, &[(0., 1.), (0., 1.)]);
        assert!(value < 1e-2, "{} at {:?}", value, best);
        assert!((bowl(&best) - value).abs() < 1e-12);
    }
}
