//! Next-token sampling over one logits row

use rayon::prelude::*;

use super::{GenerationConfig, LastTokensManager, LastTokensUnit};
use crate::error::{Result, TesseraError};
use crate::tensor::Tensor;

/// Index of the largest value; the first one wins ties
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Scale logits of ids in `window` toward zero by `penalty`
pub fn apply_repetition_penalty(logits: &mut [f32], window: &LastTokensUnit, penalty: f32) {
    for id in window.distinct() {
        if let Some(v) = logits.get_mut(id as usize) {
            *v = if *v < 0.0 { *v * penalty } else { *v / penalty };
        }
    }
}

/// Sample from already-penalized logits
///
/// `rng_value` is a uniform draw in `[0, 1)`.
fn sample_row(logits: &[f32], config: &GenerationConfig, rng_value: f32) -> u32 {
    let vocab = logits.len();
    let k = if config.top_k == 0 {
        vocab
    } else {
        config.top_k.min(vocab)
    };

    // Value descending, lower index first on ties.
    let mut ranked: Vec<(f32, u32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &v)| (v, i as u32))
        .collect();
    let by_rank = |a: &(f32, u32), b: &(f32, u32)| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1));
    if k < vocab {
        ranked.select_nth_unstable_by(k - 1, by_rank);
        ranked.truncate(k);
    }
    ranked.sort_unstable_by(by_rank);

    let max = ranked[0].0;
    let mut probs: Vec<f32> = ranked
        .iter()
        .map(|&(v, _)| ((v - max) / config.temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();

    let mut kept = probs.len();
    let mut cumulative = 0.0;
    for (i, p) in probs.iter_mut().enumerate() {
        *p /= sum;
        cumulative += *p;
        if cumulative >= config.top_p {
            kept = i + 1;
            break;
        }
    }

    let target = rng_value * cumulative;
    let mut acc = 0.0;
    for (i, &p) in probs[..kept].iter().enumerate() {
        acc += p;
        if target < acc {
            return ranked[i].1;
        }
    }
    ranked[kept - 1].1
}

/// Pick the next token from row `outer_offset` of `logits`
///
/// The row is the `outer_offset`-th run of `dims.last()` values. Simple
/// greedy configs return the argmax directly. Otherwise the repetition
/// penalty is applied for ids in `window`, then top-k, temperature,
/// softmax and top-p, and `rng_value` (uniform in `[0, 1)`) selects from
/// the remaining distribution. The caller pushes the returned id into the
/// window.
///
/// # Errors
///
/// Returns `InvalidConfiguration` if `config` fails
/// [`validate`](GenerationConfig::validate), `InvalidShape` if the row is
/// out of range or empty, or the error from reading the tensor.
pub fn llm_sampling(
    logits: &Tensor,
    outer_offset: usize,
    config: &GenerationConfig,
    window: &LastTokensUnit,
    rng_value: f32,
) -> Result<u32> {
    config.validate()?;
    let vocab = logits.dims().last().copied().unwrap_or(0);
    if vocab == 0 {
        return Err(TesseraError::InvalidShape {
            reason: format!("logits {:?} have an empty vocabulary axis", logits.dims()),
        });
    }
    let start = outer_offset
        .checked_mul(vocab)
        .ok_or_else(|| TesseraError::InvalidShape {
            reason: format!("row {outer_offset} of {vocab} logits overflows"),
        })?;
    let mut row = logits.read_f32(start, vocab)?;

    if config.is_simple_greedy() {
        return Ok(argmax(&row) as u32);
    }
    apply_repetition_penalty(&mut row, window, config.repeat_penalty);
    Ok(sample_row(&row, config, rng_value))
}

/// [`llm_sampling`] for every row of a `[batch, vocab]` logits tensor
///
/// Row `b` uses window `b` and draw `rng_values[b]`; rows are sampled in
/// parallel.
///
/// # Errors
///
/// Returns `InvalidConfiguration` for an invalid `config`, or
/// `InvalidShape` if the row count, windows and draws disagree.
pub fn llm_sampling_batch(
    logits: &Tensor,
    config: &GenerationConfig,
    windows: &LastTokensManager,
    rng_values: &[f32],
) -> Result<Vec<u32>> {
    config.validate()?;
    let vocab = logits.dims().last().copied().unwrap_or(0);
    let rows = if vocab == 0 { 0 } else { logits.count(0) / vocab };
    if rows != windows.len() || rows != rng_values.len() {
        return Err(TesseraError::InvalidShape {
            reason: format!(
                "{rows} logits rows, {} windows, {} draws",
                windows.len(),
                rng_values.len()
            ),
        });
    }
    windows
        .units()
        .par_iter()
        .zip(rng_values.par_iter())
        .enumerate()
        .map(|(b, (window, &r))| llm_sampling(logits, b, config, window, r))
        .collect()
}
