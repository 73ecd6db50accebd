//! Splits `n` samples into contiguous blocks of at most `batch_size`

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Half-open sample range `[start, end)` handled by one block job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl BlockRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, sample: usize) -> bool {
        (self.start..self.end).contains(&sample)
    }

    /// Rows of `matrix` that belong to this block
    pub fn slice_rows<'a>(&self, matrix: &'a Array2<f64>) -> PipelineResult<ArrayView2<'a, f64>> {
        if self.end > matrix.nrows() {
            return Err(PipelineError::partition(format!(
                "block {} ends at {} but the matrix has {} rows",
                self.index,
                self.end,
                matrix.nrows()
            )));
        }
        Ok(matrix.slice(s![self.start..self.end, ..]))
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{}, {})", self.index, self.start, self.end)
    }
}

/// Number of blocks, `ceil(n / batch_size)`
pub fn n_blocks(n: usize, batch_size: usize) -> PipelineResult<usize> {
    if batch_size == 0 {
        return Err(PipelineError::partition("batch size must be greater than 0"));
    }
    if n == 0 {
        return Err(PipelineError::partition("dataset has no samples"));
    }
    Ok(n.div_ceil(batch_size))
}

/// Block i covers `[i*batch_size, min((i+1)*batch_size, n))`
pub fn partition(n: usize, batch_size: usize) -> PipelineResult<Vec<BlockRange>> {
    let count = n_blocks(n, batch_size)?;
    Ok((0..count)
        .map(|index| BlockRange {
            index,
            start: index * batch_size,
            end: ((index + 1) * batch_size).min(n),
        })
        .collect())
}
