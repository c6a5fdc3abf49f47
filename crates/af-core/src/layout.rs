//! Strided layouts and the storage-overlap queries built on them.
//!
//! Strides and offsets are counted in elements of the owning storage. A view
//! never changes its storage, only the `(sizes, strides, storage_offset)`
//! triple, so every view operation here is a pure function on `Layout`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::meta::StorageId;

/// Elements enumerated by the exact overlap fallback before giving up and
/// assuming the two layouts overlap.
pub const DEFAULT_OVERLAP_ENUMERATION_LIMIT: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub sizes: Vec<usize>,
    pub strides: Vec<usize>,
    pub storage_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("rank mismatch: {sizes} sizes but {strides} strides")]
    RankMismatch { sizes: usize, strides: usize },
    #[error("dimension {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: i64, rank: usize },
    #[error("index {index} out of range for dimension of size {size}")]
    IndexOutOfRange { index: i64, size: usize },
    #[error("cannot view sizes {from:?} with strides {strides:?} as {to:?}")]
    IncompatibleView {
        from: Vec<usize>,
        strides: Vec<usize>,
        to: Vec<i64>,
    },
    #[error("storage offset would become negative ({offset})")]
    NegativeOffset { offset: i64 },
    #[error("slice step must be positive, got {step}")]
    InvalidStep { step: i64 },
}

#[must_use]
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1_usize; sizes.len()];
    let mut running = 1_usize;
    for (dim, size) in sizes.iter().enumerate().rev() {
        strides[dim] = running;
        running = running.saturating_mul((*size).max(1));
    }
    strides
}

fn normalize_dim(dim: i64, rank: usize) -> Result<usize, LayoutError> {
    let rank_i = rank as i64;
    let normalized = if dim < 0 { dim + rank_i } else { dim };
    if normalized < 0 || normalized >= rank_i {
        return Err(LayoutError::DimOutOfRange { dim, rank });
    }
    Ok(normalized as usize)
}

impl Layout {
    #[must_use]
    pub fn contiguous(sizes: &[usize]) -> Self {
        Self {
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            storage_offset: 0,
        }
    }

    pub fn new(
        sizes: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
    ) -> Result<Self, LayoutError> {
        if sizes.len() != strides.len() {
            return Err(LayoutError::RankMismatch {
                sizes: sizes.len(),
                strides: strides.len(),
            });
        }
        Ok(Self {
            sizes,
            strides,
            storage_offset,
        })
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Row-major contiguity, ignoring strides of size-1 dimensions.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1_usize;
        for (size, stride) in self.sizes.iter().zip(&self.strides).rev() {
            if *size == 1 {
                continue;
            }
            if *stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    /// Largest storage element index addressed, `None` for empty layouts.
    #[must_use]
    pub fn max_offset(&self) -> Option<usize> {
        if self.numel() == 0 {
            return None;
        }
        Some(
            self.storage_offset
                + self
                    .sizes
                    .iter()
                    .zip(&self.strides)
                    .map(|(size, stride)| (size - 1) * stride)
                    .sum::<usize>(),
        )
    }

    /// Number of storage elements between the first and last addressed element.
    #[must_use]
    pub fn span(&self) -> usize {
        self.max_offset()
            .map_or(0, |last| last - self.storage_offset + 1)
    }

    /// Storage indices of every element, in logical row-major order.
    #[must_use]
    pub fn element_offsets(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let mut index = vec![0_usize; self.rank()];
        loop {
            out.push(
                self.storage_offset
                    + index
                        .iter()
                        .zip(&self.strides)
                        .map(|(i, s)| i * s)
                        .sum::<usize>(),
            );
            let mut dim = self.rank();
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < self.sizes[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
    }

    #[must_use]
    pub fn overlap_range(&self, storage: StorageId, element_bytes: usize) -> OverlapRange {
        let element_bytes = element_bytes as u64;
        OverlapRange {
            storage,
            byte_offset: self.storage_offset as u64 * element_bytes,
            byte_length: self.span() as u64 * element_bytes,
        }
    }

    /// Offset of `self` relative to `base`, both addressing the same storage.
    #[must_use]
    pub fn offset_from(&self, base: &Layout) -> i64 {
        self.storage_offset as i64 - base.storage_offset as i64
    }

    /// `view`/`reshape` without copying. `-1` infers one dimension.
    pub fn view(&self, sizes: &[i64]) -> Result<Self, LayoutError> {
        let incompatible = || LayoutError::IncompatibleView {
            from: self.sizes.clone(),
            strides: self.strides.clone(),
            to: sizes.to_vec(),
        };
        let numel = self.numel();
        let mut inferred = None;
        let mut known = 1_usize;
        for (dim, size) in sizes.iter().enumerate() {
            match *size {
                -1 if inferred.is_none() => inferred = Some(dim),
                s if s >= 0 => known *= s as usize,
                _ => return Err(incompatible()),
            }
        }
        let mut new_sizes: Vec<usize> = sizes.iter().map(|s| (*s).max(0) as usize).collect();
        if let Some(dim) = inferred {
            if known == 0 || numel % known != 0 {
                return Err(incompatible());
            }
            new_sizes[dim] = numel / known;
        } else if known != numel {
            return Err(incompatible());
        }
        let strides =
            compute_view_strides(&self.sizes, &self.strides, &new_sizes).ok_or_else(incompatible)?;
        Ok(Self {
            sizes: new_sizes,
            strides,
            storage_offset: self.storage_offset,
        })
    }

    /// `as_strided` with the offset measured from this layout's own offset.
    pub fn as_strided(
        &self,
        sizes: &[usize],
        strides: &[usize],
        relative_offset: i64,
    ) -> Result<Self, LayoutError> {
        let offset = self.storage_offset as i64 + relative_offset;
        if offset < 0 {
            return Err(LayoutError::NegativeOffset { offset });
        }
        Self::new(sizes.to_vec(), strides.to_vec(), offset as usize)
    }

    pub fn slice(&self, dim: i64, start: i64, end: i64, step: i64) -> Result<Self, LayoutError> {
        if step <= 0 {
            return Err(LayoutError::InvalidStep { step });
        }
        let dim = normalize_dim(dim, self.rank())?;
        let size = self.sizes[dim] as i64;
        let clamp = |value: i64| {
            let value = if value < 0 { value + size } else { value };
            value.clamp(0, size)
        };
        let start = clamp(start);
        let end = clamp(end).max(start);
        let mut out = self.clone();
        out.sizes[dim] = ((end - start + step - 1) / step) as usize;
        out.strides[dim] = self.strides[dim] * step as usize;
        out.storage_offset = self.storage_offset + start as usize * self.strides[dim];
        Ok(out)
    }

    pub fn select(&self, dim: i64, index: i64) -> Result<Self, LayoutError> {
        let dim = normalize_dim(dim, self.rank())?;
        let size = self.sizes[dim];
        let normalized = if index < 0 { index + size as i64 } else { index };
        if normalized < 0 || normalized >= size as i64 {
            return Err(LayoutError::IndexOutOfRange { index, size });
        }
        let mut out = self.clone();
        out.storage_offset += normalized as usize * self.strides[dim];
        out.sizes.remove(dim);
        out.strides.remove(dim);
        Ok(out)
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self, LayoutError> {
        let dim0 = normalize_dim(dim0, self.rank())?;
        let dim1 = normalize_dim(dim1, self.rank())?;
        let mut out = self.clone();
        out.sizes.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        Ok(out)
    }

    pub fn unsqueeze(&self, dim: i64) -> Result<Self, LayoutError> {
        let dim = normalize_dim(dim, self.rank() + 1)?;
        let stride = if dim < self.rank() {
            self.sizes[dim] * self.strides[dim]
        } else {
            1
        };
        let mut out = self.clone();
        out.sizes.insert(dim, 1);
        out.strides.insert(dim, stride);
        Ok(out)
    }

    pub fn unbind(&self, dim: i64) -> Result<Vec<Self>, LayoutError> {
        let normalized = normalize_dim(dim, self.rank())?;
        (0..self.sizes[normalized])
            .map(|index| self.select(dim, index as i64))
            .collect()
    }
}

/// Stride computation for a copy-free reshape; `None` when the requested
/// sizes cannot be expressed over the existing strides.
fn compute_view_strides(
    old_sizes: &[usize],
    old_strides: &[usize],
    new_sizes: &[usize],
) -> Option<Vec<usize>> {
    if old_sizes.is_empty() {
        return Some(vec![1; new_sizes.len()]);
    }
    let numel: usize = old_sizes.iter().product();
    if numel == 0 {
        return Some(contiguous_strides(new_sizes));
    }

    let mut new_strides = vec![0_usize; new_sizes.len()];
    let mut view_dim = new_sizes.len() as isize - 1;
    let mut chunk_base_stride = *old_strides.last()?;
    let mut tensor_numel = 1_usize;
    let mut view_numel = 1_usize;

    for tensor_dim in (0..old_sizes.len()).rev() {
        tensor_numel *= old_sizes[tensor_dim];
        let chunk_ends = tensor_dim == 0
            || (old_sizes[tensor_dim - 1] != 1
                && old_strides[tensor_dim - 1] != tensor_numel * chunk_base_stride);
        if chunk_ends {
            while view_dim >= 0
                && (view_numel < tensor_numel || new_sizes[view_dim as usize] == 1)
            {
                new_strides[view_dim as usize] = view_numel * chunk_base_stride;
                view_numel *= new_sizes[view_dim as usize];
                view_dim -= 1;
            }
            if view_numel != tensor_numel {
                return None;
            }
            if tensor_dim > 0 {
                chunk_base_stride = old_strides[tensor_dim - 1];
                tensor_numel = 1;
                view_numel = 1;
            }
        }
    }
    if view_dim != -1 {
        return None;
    }
    Some(new_strides)
}

/// `(storage, byte_offset, byte_length)` covering every byte a layout may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlapRange {
    pub storage: StorageId,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl OverlapRange {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.storage == other.storage
            && self.byte_length > 0
            && other.byte_length > 0
            && self.byte_offset < other.end()
            && other.byte_offset < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlapVerdict {
    Disjoint,
    Overlapping,
    Unknown,
}

fn quick_overlap_verdict(a: &Layout, b: &Layout) -> OverlapVerdict {
    if a.numel() == 0 || b.numel() == 0 {
        return OverlapVerdict::Disjoint;
    }
    let (x, y) = if a.storage_offset <= b.storage_offset {
        (a, b)
    } else {
        (b, a)
    };

    if x.is_contiguous() && y.is_contiguous() {
        return if x.storage_offset + x.numel() > y.storage_offset {
            OverlapVerdict::Overlapping
        } else {
            OverlapVerdict::Disjoint
        };
    }

    if let Some(x_last) = x.max_offset()
        && x_last < y.storage_offset
    {
        return OverlapVerdict::Disjoint;
    }

    // Row-contiguous 2-D layouts sharing an outer stride: fold y's first row
    // back onto x's rows and test that one interval.
    if x.rank() == 2
        && y.rank() == 2
        && x.strides[1] == 1
        && y.strides[1] == 1
        && x.strides[0] == y.strides[0]
        && x.strides[0] > 0
    {
        let row_stride = x.strides[0];
        let delta = y.storage_offset - x.storage_offset;
        if delta < x.sizes[1] {
            return OverlapVerdict::Overlapping;
        }
        let covered = row_stride * (x.sizes[0] - 1) + x.sizes[1];
        if covered <= delta {
            return OverlapVerdict::Disjoint;
        }
        let folded = delta % row_stride;
        if folded >= x.sizes[1] && folded + y.sizes[1] <= row_stride {
            return OverlapVerdict::Disjoint;
        }
    }

    OverlapVerdict::Unknown
}

/// Whether two layouts over the same storage address a common element.
///
/// Cheap structural checks decide most cases; otherwise the element sets are
/// enumerated when both fit under `enumeration_limit`, and anything larger is
/// conservatively reported as overlapping.
#[must_use]
pub fn layouts_overlap(a: &Layout, b: &Layout, enumeration_limit: usize) -> bool {
    match quick_overlap_verdict(a, b) {
        OverlapVerdict::Disjoint => false,
        OverlapVerdict::Overlapping => true,
        OverlapVerdict::Unknown => {
            if a.numel() + b.numel() > enumeration_limit {
                return true;
            }
            let left: rustc_hash::FxHashSet<usize> = a.element_offsets().into_iter().collect();
            b.element_offsets()
                .into_iter()
                .any(|offset| left.contains(&offset))
        }
    }
}
