//! Relevance classifiers
//!
//! [`ClassifierTrainer`] fits a [`Classifier`] to labelled feature vectors.
//! The built-in [`LogisticTrainer`] runs stochastic gradient descent over the
//! fixed-width [`FeatureVector::summary`], so a model trained on one batch
//! of documents accepts documents of any length.

use super::encoder::{FeatureVector, SUMMARY_WIDTH};
use super::RetrainError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Binary relevance label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Negative,
}

impl Label {
    fn target(self) -> f64 {
        match self {
            Label::Positive => 1.0,
            Label::Negative => 0.0,
        }
    }
}

impl From<bool> for Label {
    fn from(relevant: bool) -> Self {
        if relevant {
            Label::Positive
        } else {
            Label::Negative
        }
    }
}

/// A trained, immutable relevance model
pub trait Classifier: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn predict(&self, features: &FeatureVector) -> Label;
}

/// Produces a classifier from a labelled training set
pub trait ClassifierTrainer: Send + Sync {
    fn fit(
        &self,
        vectors: &[FeatureVector],
        labels: &[Label],
    ) -> Result<Arc<dyn Classifier>, RetrainError>;
}

/// Logistic regression over the pooled feature summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticClassifier {
    weights: [f64; SUMMARY_WIDTH],
    bias: f64,
    threshold: f64,
}

impl LogisticClassifier {
    pub fn new(weights: [f64; SUMMARY_WIDTH], bias: f64) -> Self {
        Self {
            weights,
            bias,
            threshold: 0.5,
        }
    }

    pub fn weights(&self) -> &[f64; SUMMARY_WIDTH] {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Probability that the document is relevant
    pub fn probability(&self, features: &FeatureVector) -> f64 {
        sigmoid(self.logit(&features.summary()))
    }

    fn logit(&self, x: &[f64; SUMMARY_WIDTH]) -> f64 {
        self.weights
            .iter()
            .zip(x.iter())
            .map(|(w, v)| w * v)
            .sum::<f64>()
            + self.bias
    }
}

impl Classifier for LogisticClassifier {
    fn name(&self) -> &str {
        "logistic"
    }

    fn predict(&self, features: &FeatureVector) -> Label {
        Label::from(self.probability(features) >= self.threshold)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Stochastic gradient descent trainer for [`LogisticClassifier`]
///
/// Sample order is shuffled with a seeded RNG, so the same training set
/// always yields the same model.
#[derive(Debug, Clone)]
pub struct LogisticTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
    /// L2 penalty on the weights (not the bias)
    pub l2: f64,
    pub seed: u64,
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            epochs: 200,
            l2: 1e-4,
            seed: 0x5eed,
        }
    }
}

impl LogisticTrainer {
    pub fn train(
        &self,
        vectors: &[FeatureVector],
        labels: &[Label],
    ) -> Result<LogisticClassifier, RetrainError> {
        if vectors.len() != labels.len() {
            return Err(RetrainError::Training(format!(
                "{} feature vectors but {} labels",
                vectors.len(),
                labels.len()
            )));
        }
        if vectors.is_empty() {
            return Err(RetrainError::Training("empty training set".to_string()));
        }

        let samples: Vec<([f64; SUMMARY_WIDTH], f64)> = vectors
            .iter()
            .zip(labels)
            .map(|(v, l)| (v.summary(), l.target()))
            .collect();

        let mut model = LogisticClassifier::new([0.0; SUMMARY_WIDTH], 0.0);
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);

        for _ in 0..self.epochs {
            order.shuffle(&mut rng);
            for &i in &order {
                let (x, y) = &samples[i];
                // Gradient step: w += α * (y - p) * x - α * λ * w
                let error = y - sigmoid(model.logit(x));
                for (w, v) in model.weights.iter_mut().zip(x.iter()) {
                    *w += self.learning_rate * (error * v - self.l2 * *w);
                }
                model.bias += self.learning_rate * error;
            }
        }

        if model.weights.iter().any(|w| !w.is_finite()) || !model.bias.is_finite() {
            return Err(RetrainError::Training("weights diverged".to_string()));
        }

        debug!(
            "Trained logistic model on {} samples: weights={:?} bias={:.3}",
            samples.len(),
            model.weights,
            model.bias
        );
        Ok(model)
    }
}

impl ClassifierTrainer for LogisticTrainer {
    fn fit(
        &self,
        vectors: &[FeatureVector],
        labels: &[Label],
    ) -> Result<Arc<dyn Classifier>, RetrainError> {
        Ok(Arc::new(self.train(vectors, labels)?))
    }
}
