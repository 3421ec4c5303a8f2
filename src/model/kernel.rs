use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::codec::ResourceRange;

pub trait Kernel: Clone + Send + Sync + std::fmt::Debug {
    fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64;

    fn gradient_first(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array1<f64>;

    fn matrix(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
            self.eval(a.row(i), b.row(j))
        })
    }

    fn diagonal(&self, a: ArrayView2<f64>) -> Array1<f64> {
        a.rows().into_iter().map(|row| self.eval(row, row)).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SquaredExp {
    pub lengthscale: f64,
    pub amplitude: f64,
}

impl Default for SquaredExp {
    fn default() -> Self {
        Self {
            lengthscale: 1.,
            amplitude: 1.,
        }
    }
}

impl SquaredExp {
    pub fn new(lengthscale: f64, amplitude: f64) -> Self {
        Self {
            lengthscale,
            amplitude,
        }
    }

    pub fn scaled(&self, scale: f64) -> Self {
        Self {
            lengthscale: self.lengthscale,
            amplitude: self.amplitude * scale,
        }
    }

    fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
    }
}

impl Kernel for SquaredExp {
    fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let d2 = Self::squared_distance(a, b);
        self.amplitude * (-0.5 * d2 / self.lengthscale.powi(2)).exp()
    }

    fn gradient_first(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array1<f64> {
        let k = self.eval(a, b);
        let inv_ls2 = 1. / self.lengthscale.powi(2);
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| -k * (x - y) * inv_ls2)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultiTaskKernel {
    pub base: SquaredExp,
    pub resource_lengthscale: f64,
    pub range: ResourceRange,
}

impl MultiTaskKernel {
    fn resource_factor(&self, ra: f64, rb: f64) -> f64 {
        let d = self.range.normalize(ra) - self.range.normalize(rb);
        (-0.5 * d * d / self.resource_lengthscale.powi(2)).exp()
    }
}

impl Kernel for MultiTaskKernel {
    fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let (xa, ra) = split(a);
        let (xb, rb) = split(b);
        self.base.eval(xa, xb) * self.resource_factor(ra, rb)
    }

    fn gradient_first(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array1<f64> {
        let (xa, ra) = split(a);
        let (xb, rb) = split(b);
        let factor = self.resource_factor(ra, rb);
        with_resource_slot(self.base.gradient_first(xa, xb).mapv(|g| g * factor))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CurveKernel {
    ExpDecay {
        alpha: f64,
        beta: f64,
        amplitude: f64,
    },
    Issm { level_variance: f64, max_resource: u32 },
}

impl CurveKernel {
    pub fn eval(&self, ra: f64, rb: f64) -> f64 {
        match *self {
            CurveKernel::ExpDecay {
                alpha,
                beta,
                amplitude,
            } => amplitude * (beta / (ra + rb + beta)).powf(alpha),
            CurveKernel::Issm {
                level_variance,
                max_resource,
            } => level_variance * ra.min(rb) / max_resource as f64,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdditiveKernel {
    pub base: SquaredExp,
    pub curve: CurveKernel,
}

impl Kernel for AdditiveKernel {
    fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let (xa, ra) = split(a);
        let (xb, rb) = split(b);
        let shared = self.base.eval(xa, xb);
        if xa == xb {
            shared + self.curve.eval(ra, rb)
        } else {
            shared
        }
    }

    fn gradient_first(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array1<f64> {
        let (xa, _) = split(a);
        let (xb, _) = split(b);
        with_resource_slot(self.base.gradient_first(xa, xb))
    }
}

fn with_resource_slot(gradient: Array1<f64>) -> Array1<f64> {
    gradient.into_iter().chain(std::iter::once(0.)).collect()
}

fn split(extended: ArrayView1<f64>) -> (ArrayView1<f64>, f64) {
    let n = extended.len();
    (extended.slice_move(ndarray::s![..n - 1]), extended[n - 1])
}
