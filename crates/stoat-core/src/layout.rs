use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how a tensor's logical shape maps onto flat storage
//
// A Layout is shape + strides + offset. Decoupling the logical shape from
// the memory arrangement is what makes transposition and broadcasting free:
// a transposed operand is the same storage read with swapped strides, and a
// broadcast operand repeats data through zero strides. The operation-tree
// evaluator leans on both to fuse views into a single pass without copies.

/// Memory layout of a tensor: shape, strides, and start offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Contiguous (row-major) layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this layout is row-major with no gaps and offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions. No data is moved; only shape and strides change.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// View this layout broadcast to `target`.
    ///
    /// Dimensions are aligned from the right; wherever this layout has
    /// size 1 against a larger target dim (or is missing a leading dim)
    /// the stride becomes 0, repeating the single element.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        if self_dims.len() > target_dims.len() {
            return Err(Error::invalid_shape(format!(
                "cannot broadcast {} to lower-rank {}",
                self.shape, target
            )));
        }
        let offset = target_dims.len() - self_dims.len();
        let mut strides = vec![0usize; target_dims.len()];
        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                strides[i + offset] = self.strides[i];
            } else if self_dims[i] == 1 {
                strides[i + offset] = 0;
            } else {
                return Err(Error::invalid_shape(format!(
                    "cannot broadcast {} to {}",
                    self.shape, target
                )));
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index for a multi-dimensional index:
    /// `offset + sum(index[i] * stride[i])`.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Flat storage index for a linear position in logical (row-major) order.
    ///
    /// Decomposes `pos` into a multi-index over `dims` and applies strides.
    /// This is the per-element address computation fused passes use.
    pub fn linear_to_flat(&self, mut pos: usize) -> usize {
        let mut flat = self.offset;
        for i in (0..self.strides.len()).rev() {
            let d = self.shape.dims()[i];
            flat += (pos % d) * self.strides[i];
            pos /= d;
        }
        flat
    }

    /// Iterator over flat storage indices in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator yielding the flat storage index of each element of a Layout,
/// in logical row-major order. Contiguous layouts count 0, 1, 2, ...;
/// transposed or broadcast views jump according to their strides.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        let rank = layout.rank();
        StridedIter {
            current: vec![0; rank],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
