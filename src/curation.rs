use log::info;
use ndarray::ArrayView2;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{KelpError, Result};

/// Sample indices assigned to each side of a train/validation split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

/// Shuffle `0..len` with `seed` and cut it at `floor(len * train_ratio)`.
///
/// The same `(len, train_ratio, seed)` always gives the same split.
pub fn random_split(len: usize, train_ratio: f64, seed: u64) -> Result<Split> {
    if !(0.0..=1.0).contains(&train_ratio) {
        return Err(KelpError::InvalidConfig(format!(
            "train ratio must be in [0, 1], got {}",
            train_ratio
        )));
    }

    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let cut = (len as f64 * train_ratio).floor() as usize;
    let val = indices.split_off(cut);
    info!(
        "Split {} samples (seed {}): {} train, {} val",
        len,
        seed,
        indices.len(),
        val.len()
    );
    Ok(Split {
        train: indices,
        val,
    })
}

/// Indices of label masks containing at least one non-background pixel.
pub fn presence_indices<'a, I>(masks: I) -> Vec<usize>
where
    I: IntoIterator<Item = ArrayView2<'a, u8>>,
{
    masks
        .into_iter()
        .enumerate()
        .filter(|(_, mask)| mask.iter().any(|&v| v > 0))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_split_is_reproducible() {
        let a = random_split(100, 0.8, 42).unwrap();
        let b = random_split(100, 0.8, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.train.len(), 80);
        assert_eq!(a.val.len(), 20);

        let c = random_split(100, 0.8, 7).unwrap();
        assert_ne!(a.train, c.train);
    }

    #[test]
    fn test_split_partitions_indices() {
        let split = random_split(37, 0.5, 1).unwrap();
        assert_eq!(split.train.len(), 18);
        let mut all: Vec<usize> = split.train.iter().chain(&split.val).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..37).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_rejects_bad_ratio() {
        assert!(random_split(10, 1.5, 0).is_err());
        assert!(random_split(10, -0.1, 0).is_err());
        assert_eq!(random_split(0, 0.8, 0).unwrap().train.len(), 0);
    }

    #[test]
    fn test_presence_indices() {
        let empty = Array2::<u8>::zeros((4, 4));
        let mut kelp = Array2::<u8>::zeros((4, 4));
        kelp[[3, 1]] = 2;
        let masks = [empty.view(), kelp.view(), empty.view(), kelp.view()];
        assert_eq!(presence_indices(masks), vec![1, 3]);
    }
}
