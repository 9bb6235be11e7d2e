//! Evaluation metrics for merged-model quality tracking.
//!
//! Two computation modes: `Batch` metrics are stateless and computed
//! immediately from one batch; `Full` metrics accumulate across every batch
//! of a split and are finalized once at the end. Batch submission order
//! never affects a finalized value.

use std::collections::BTreeMap;
use std::str::FromStr;

use candle_core::{DType, Tensor};
use thiserror::Error;

/// Label value marking positions excluded from the loss.
const IGNORE_INDEX: i64 = -100;

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("unknown metric name `{0}`")]
    UnknownMetric(String),

    #[error("metric `{metric}` requires `{field}`")]
    MissingField {
        metric: &'static str,
        field: &'static str,
    },

    #[error("metric `{0}` has no finalized value before any batch was added")]
    Empty(&'static str),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Recognized metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricName {
    /// Passthrough of a precomputed scalar loss.
    Loss,
    /// `exp(mean(per-batch losses))`.
    Perplexity,
    /// Top-k classification match rate, in percent.
    Accuracy,
    /// Minimum-loss candidate selection over grouped questions, in percent.
    MultipleChoiceAccuracy,
    /// As above with length-normalized candidate losses.
    MultipleChoiceAccuracyNorm,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Loss => "loss",
            MetricName::Perplexity => "perplexity",
            MetricName::Accuracy => "accuracy",
            MetricName::MultipleChoiceAccuracy => "multiple_choice_accuracy",
            MetricName::MultipleChoiceAccuracyNorm => "multiple_choice_accuracy_norm",
        }
    }

    pub fn mode(&self) -> MetricMode {
        match self {
            MetricName::Loss | MetricName::Accuracy => MetricMode::Batch,
            MetricName::Perplexity
            | MetricName::MultipleChoiceAccuracy
            | MetricName::MultipleChoiceAccuracyNorm => MetricMode::Full,
        }
    }
}

impl FromStr for MetricName {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, MetricError> {
        match s {
            "loss" => Ok(Self::Loss),
            "perplexity" => Ok(Self::Perplexity),
            "accuracy" => Ok(Self::Accuracy),
            "multiple_choice_accuracy" => Ok(Self::MultipleChoiceAccuracy),
            "multiple_choice_accuracy_norm" => Ok(Self::MultipleChoiceAccuracyNorm),
            other => Err(MetricError::UnknownMetric(other.to_string())),
        }
    }
}

/// Stateless-per-batch vs. accumulated-across-split computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricMode {
    Batch,
    Full,
}

/// Model outputs for one evaluation batch.
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    /// Precomputed mean loss for the batch.
    pub loss: Option<f64>,
    /// Logits: `[n, classes]` for classification, `[batch, seq, vocab]` for
    /// language-model candidates.
    pub logits: Option<Tensor>,
}

/// Ground-truth side of one evaluation batch.
#[derive(Debug, Clone, Default)]
pub struct EvalInput {
    /// Class targets `[n]` (i64) or token labels `[batch, seq]` (i64, with
    /// -100 on ignored positions).
    pub targets: Option<Tensor>,
    /// Question id per candidate row, for grouped multiple-choice scoring.
    pub question_ids: Option<Vec<i64>>,
    /// Whether each candidate row is the marked-correct one.
    pub correct_labels: Option<Vec<bool>>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    loss: f64,
    correct: bool,
}

#[derive(Debug, Clone)]
enum MetricState {
    Stateless,
    Perplexity {
        losses: Vec<f64>,
    },
    MultipleChoice {
        normalized: bool,
        groups: BTreeMap<i64, Vec<Candidate>>,
    },
}

/// One metric instance. `Full` metrics own accumulator state; `Batch`
/// metrics compute directly from a batch.
#[derive(Debug, Clone)]
pub struct Metric {
    name: MetricName,
    state: MetricState,
}

impl Metric {
    pub fn new(name: MetricName) -> Self {
        let state = match name {
            MetricName::Perplexity => MetricState::Perplexity { losses: Vec::new() },
            MetricName::MultipleChoiceAccuracy => MetricState::MultipleChoice {
                normalized: false,
                groups: BTreeMap::new(),
            },
            MetricName::MultipleChoiceAccuracyNorm => MetricState::MultipleChoice {
                normalized: true,
                groups: BTreeMap::new(),
            },
            _ => MetricState::Stateless,
        };
        Self { name, state }
    }

    pub fn name(&self) -> MetricName {
        self.name
    }

    pub fn mode(&self) -> MetricMode {
        self.name.mode()
    }

    /// Feed one batch into a `Full` accumulator. No-op for `Batch` metrics.
    pub fn add(&mut self, input: &EvalInput, output: &EvalOutput) -> Result<(), MetricError> {
        match &mut self.state {
            MetricState::Stateless => Ok(()),
            MetricState::Perplexity { losses } => {
                let loss = output.loss.ok_or(MetricError::MissingField {
                    metric: "perplexity",
                    field: "loss",
                })?;
                losses.push(loss);
                Ok(())
            }
            MetricState::MultipleChoice { normalized, groups } => {
                let logits = output.logits.as_ref().ok_or(MetricError::MissingField {
                    metric: "multiple_choice_accuracy",
                    field: "logits",
                })?;
                let targets = input.targets.as_ref().ok_or(MetricError::MissingField {
                    metric: "multiple_choice_accuracy",
                    field: "targets",
                })?;
                let ids = input.question_ids.as_ref().ok_or(MetricError::MissingField {
                    metric: "multiple_choice_accuracy",
                    field: "question_ids",
                })?;
                let correct = input
                    .correct_labels
                    .as_ref()
                    .ok_or(MetricError::MissingField {
                        metric: "multiple_choice_accuracy",
                        field: "correct_labels",
                    })?;

                let per_sample = candidate_losses(logits, targets)?;
                for (i, (sum, count)) in per_sample.iter().enumerate() {
                    let loss = if *normalized {
                        sum / (*count).max(1) as f64
                    } else {
                        *sum
                    };
                    groups.entry(ids[i]).or_default().push(Candidate {
                        loss,
                        correct: correct[i],
                    });
                }
                Ok(())
            }
        }
    }

    /// Compute a `Batch` metric from one batch.
    pub fn evaluate_batch(
        &self,
        input: &EvalInput,
        output: &EvalOutput,
    ) -> Result<f64, MetricError> {
        match self.name {
            MetricName::Loss => output.loss.ok_or(MetricError::MissingField {
                metric: "loss",
                field: "loss",
            }),
            MetricName::Accuracy => {
                let logits = output.logits.as_ref().ok_or(MetricError::MissingField {
                    metric: "accuracy",
                    field: "logits",
                })?;
                let targets = input.targets.as_ref().ok_or(MetricError::MissingField {
                    metric: "accuracy",
                    field: "targets",
                })?;
                accuracy(logits, targets, 1)
            }
            _ => Err(MetricError::Empty(self.name.as_str())),
        }
    }

    /// Finalize a `Full` accumulator.
    pub fn finalize(&self) -> Result<f64, MetricError> {
        match &self.state {
            MetricState::Perplexity { losses } => {
                if losses.is_empty() {
                    return Err(MetricError::Empty("perplexity"));
                }
                let mean = losses.iter().sum::<f64>() / losses.len() as f64;
                Ok(mean.exp())
            }
            MetricState::MultipleChoice { groups, .. } => {
                if groups.is_empty() {
                    return Err(MetricError::Empty("multiple_choice_accuracy"));
                }
                let mut resolved = 0usize;
                for candidates in groups.values() {
                    let predicted = candidates
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| {
                            a.loss
                                .partial_cmp(&b.loss)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|(i, _)| i);
                    let marked = candidates.iter().position(|c| c.correct);
                    if predicted.is_some() && predicted == marked {
                        resolved += 1;
                    }
                }
                Ok(resolved as f64 / groups.len() as f64 * 100.0)
            }
            MetricState::Stateless => Err(MetricError::Empty(self.name.as_str())),
        }
    }
}

/// Top-k classification accuracy in percent.
///
/// `logits` is `[n, classes]`; `targets` is `[n]` integer class ids.
pub fn accuracy(logits: &Tensor, targets: &Tensor, topk: usize) -> Result<f64, MetricError> {
    let scores = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let targets = targets.to_dtype(DType::I64)?.to_vec1::<i64>()?;

    let mut correct = 0usize;
    for (row, &target) in scores.iter().zip(&targets) {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if order[..topk.min(order.len())]
            .iter()
            .any(|&i| i as i64 == target)
        {
            correct += 1;
        }
    }
    Ok(correct as f64 / targets.len().max(1) as f64 * 100.0)
}

/// Per-candidate cross-entropy over shifted logits/labels.
///
/// `logits` is `[batch, seq, vocab]`, `labels` is `[batch, seq]` with -100
/// marking ignored positions. Returns `(loss_sum, label_count)` per row.
fn candidate_losses(logits: &Tensor, labels: &Tensor) -> Result<Vec<(f64, usize)>, MetricError> {
    let (bsz, seq, _vocab) = logits.dims3()?;

    // Predict token t+1 from position t.
    let shift_logits = logits.narrow(1, 0, seq - 1)?;
    let shift_labels = labels.narrow(1, 1, seq - 1)?;

    let log_probs = candle_nn::ops::log_softmax(
        &shift_logits.to_dtype(DType::F32)?,
        candle_core::D::Minus1,
    )?
    .to_vec3::<f32>()?;
    let labels = shift_labels.to_dtype(DType::I64)?.to_vec2::<i64>()?;

    let mut out = Vec::with_capacity(bsz);
    for b in 0..bsz {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (pos, &label) in labels[b].iter().enumerate() {
            if label == IGNORE_INDEX {
                continue;
            }
            sum -= log_probs[b][pos][label as usize] as f64;
            count += 1;
        }
        out.push((sum, count));
    }
    Ok(out)
}

/// Direction in which the pivot metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotDirection {
    Up,
    Down,
}

/// Best-so-far tracker for the split's pivot metric.
#[derive(Debug, Clone)]
pub struct Pivot {
    pub name: MetricName,
    pub direction: PivotDirection,
    pub value: f64,
}

impl Pivot {
    pub fn new(name: MetricName, direction: PivotDirection) -> Self {
        let value = match direction {
            PivotDirection::Up => f64::NEG_INFINITY,
            PivotDirection::Down => f64::INFINITY,
        };
        Self {
            name,
            direction,
            value,
        }
    }

    /// Whether `val` beats the best value seen so far.
    pub fn improved(&self, val: f64) -> bool {
        match self.direction {
            PivotDirection::Up => val > self.value,
            PivotDirection::Down => val < self.value,
        }
    }

    pub fn update(&mut self, val: f64) {
        self.value = val;
    }
}

/// Metrics registry keyed by split name.
#[derive(Debug, Clone)]
pub struct MetricSet {
    metrics: BTreeMap<String, Vec<Metric>>,
    pivot: Pivot,
}

impl MetricSet {
    /// Build from per-split metric name lists; unknown names are rejected.
    pub fn from_names(
        splits: &[(&str, &[&str])],
        pivot_name: &str,
        pivot_direction: PivotDirection,
    ) -> Result<Self, MetricError> {
        let mut metrics = BTreeMap::new();
        for (split, names) in splits {
            let parsed: Vec<Metric> = names
                .iter()
                .map(|n| n.parse::<MetricName>().map(Metric::new))
                .collect::<Result<_, _>>()?;
            metrics.insert((*split).to_string(), parsed);
        }
        let pivot = Pivot::new(pivot_name.parse()?, pivot_direction);
        Ok(Self { metrics, pivot })
    }

    pub fn pivot(&self) -> &Pivot {
        &self.pivot
    }

    pub fn pivot_mut(&mut self) -> &mut Pivot {
        &mut self.pivot
    }

    /// Feed a batch into every `Full` metric of `split`.
    pub fn add(
        &mut self,
        split: &str,
        input: &EvalInput,
        output: &EvalOutput,
    ) -> Result<(), MetricError> {
        if let Some(metrics) = self.metrics.get_mut(split) {
            for m in metrics.iter_mut().filter(|m| m.mode() == MetricMode::Full) {
                m.add(input, output)?;
            }
        }
        Ok(())
    }

    /// Evaluate all metrics of `split` matching `mode`. `Batch` metrics read
    /// the supplied batch; `Full` metrics finalize their accumulator.
    pub fn evaluate(
        &self,
        split: &str,
        mode: MetricMode,
        input: Option<&EvalInput>,
        output: Option<&EvalOutput>,
    ) -> Result<BTreeMap<MetricName, f64>, MetricError> {
        let mut out = BTreeMap::new();
        let Some(metrics) = self.metrics.get(split) else {
            return Ok(out);
        };
        for m in metrics.iter().filter(|m| m.mode() == mode) {
            let value = match mode {
                MetricMode::Batch => {
                    let input = input.ok_or(MetricError::MissingField {
                        metric: "batch evaluation",
                        field: "input",
                    })?;
                    let output = output.ok_or(MetricError::MissingField {
                        metric: "batch evaluation",
                        field: "output",
                    })?;
                    m.evaluate_batch(input, output)?
                }
                MetricMode::Full => m.finalize()?,
            };
            out.insert(m.name(), value);
        }
        Ok(out)
    }
}
