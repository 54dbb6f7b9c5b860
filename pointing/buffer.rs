// ========================================================================================
//
//                         Typed, validated views over caller buffers
//
// ========================================================================================
//
// Callers hand the engine opaque buffers: an element pointer, an element type tag, and
// per-axis extents and strides. Nothing in the compute path trusts those descriptions.
// Every buffer is checked once, up front, against the element type, rank and extents
// that the operation expects, and against the contiguous row-major layout the kernel
// indexes with. Only a buffer that passes becomes a `View`/`ViewMut`, which is just a
// typed slice plus its actual shape.

use std::fmt;
use std::marker::PhantomData;

use ndarray::{ArrayView, ArrayViewMut, Dimension};
use thiserror::Error;

use crate::intervals::Interval;

/// The element type tag carried by a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    I32,
    I64,
    F64,
    Interval,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "uint8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F64 => "float64",
            DType::Interval => "interval",
        };
        f.write_str(name)
    }
}

/// Plain-old-data element types that may travel through a [`Buffer`] and be copied
/// bytewise to and from device memory.
///
/// # Safety
/// Implementors must be valid for every bit pattern, contain no pointers, and have an
/// alignment no larger than 8 bytes.
pub unsafe trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

unsafe impl Element for u8 {
    const DTYPE: DType = DType::U8;
}

unsafe impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

unsafe impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

unsafe impl Element for f64 {
    const DTYPE: DType = DType::F64;
}

unsafe impl Element for Interval {
    const DTYPE: DType = DType::Interval;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer '{name}' has element type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: DType,
        found: DType,
    },
    #[error("buffer '{name}' has shape {found:?}, expected {expected:?} (-1 matches any extent)")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<usize>,
    },
    #[error("buffer '{name}' is not contiguous row-major (shape {shape:?}, strides {strides:?})")]
    Stride {
        name: String,
        shape: Vec<usize>,
        strides: Vec<isize>,
    },
    #[error("buffer '{name}' is read-only but is written by this operation")]
    ReadOnly { name: String },
    #[error("a slice of {len} elements cannot be viewed with shape {shape:?}")]
    Length { len: usize, shape: Vec<usize> },
}

/// A caller-supplied, strided, typed block of memory borrowed for `'a`.
///
/// Strides are counted in elements, as `ndarray` reports them.
pub struct Buffer<'a> {
    ptr: *mut u8,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<isize>,
    writable: bool,
    marker: PhantomData<&'a mut [u8]>,
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("writable", &self.writable)
            .finish()
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut step = 1isize;
    for (stride, &extent) in strides.iter_mut().zip(shape).rev() {
        *stride = step;
        step *= extent.max(1) as isize;
    }
    strides
}

fn check_len(len: usize, shape: &[usize]) -> Result<(), BufferError> {
    if shape.iter().product::<usize>() != len {
        return Err(BufferError::Length {
            len,
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

impl<'a> Buffer<'a> {
    /// Describes a read-only slice as a row-major array of the given shape.
    pub fn from_slice<T: Element>(data: &'a [T], shape: &[usize]) -> Result<Self, BufferError> {
        check_len(data.len(), shape)?;
        Ok(Self {
            ptr: data.as_ptr() as *mut u8,
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            writable: false,
            marker: PhantomData,
        })
    }

    /// Describes a writable slice as a row-major array of the given shape.
    pub fn from_slice_mut<T: Element>(
        data: &'a mut [T],
        shape: &[usize],
    ) -> Result<Self, BufferError> {
        check_len(data.len(), shape)?;
        Ok(Self {
            ptr: data.as_mut_ptr().cast::<u8>(),
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            strides: row_major_strides(shape),
            writable: true,
            marker: PhantomData,
        })
    }

    /// Wraps an arbitrary buffer description.
    ///
    /// # Safety
    /// `ptr` must address memory holding elements of `dtype` at every index reachable
    /// through `shape` and `strides`, valid for reads (and for writes when `writable`)
    /// for all of `'a`, and not mutated through any other path while it is borrowed.
    pub unsafe fn from_raw_parts(
        ptr: *mut u8,
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<isize>,
        writable: bool,
    ) -> Self {
        Self {
            ptr,
            dtype,
            shape,
            strides,
            writable,
            marker: PhantomData,
        }
    }

    /// Validates this buffer for read access and returns a typed view.
    ///
    /// `expected` holds one entry per axis; a negative entry accepts any extent. The
    /// buffer is consumed, so a writable buffer cannot also yield a mutable view.
    pub fn extract<T: Element>(self, name: &str, expected: &[i64]) -> Result<View<'a, T>, BufferError> {
        self.validate::<T>(name, expected)?;
        Ok(View {
            ptr: self.ptr.cast_const().cast::<T>(),
            shape: self.shape,
            marker: PhantomData,
        })
    }

    /// Validates this buffer for write access and returns a typed mutable view.
    ///
    /// The buffer is consumed so that at most one mutable view can exist.
    pub fn extract_mut<T: Element>(
        self,
        name: &str,
        expected: &[i64],
    ) -> Result<ViewMut<'a, T>, BufferError> {
        self.validate::<T>(name, expected)?;
        if !self.writable {
            return Err(BufferError::ReadOnly {
                name: name.to_string(),
            });
        }
        Ok(ViewMut {
            ptr: self.ptr.cast::<T>(),
            shape: self.shape,
            marker: PhantomData,
        })
    }

    fn validate<T: Element>(&self, name: &str, expected: &[i64]) -> Result<(), BufferError> {
        if self.dtype != T::DTYPE {
            return Err(BufferError::TypeMismatch {
                name: name.to_string(),
                expected: T::DTYPE,
                found: self.dtype,
            });
        }

        let extents_match = self.shape.len() == expected.len()
            && self
                .shape
                .iter()
                .zip(expected)
                .all(|(&actual, &wanted)| wanted < 0 || actual as i64 == wanted);
        if !extents_match {
            return Err(BufferError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                found: self.shape.clone(),
            });
        }

        if !is_row_major(&self.shape, &self.strides) {
            return Err(BufferError::Stride {
                name: name.to_string(),
                shape: self.shape.clone(),
                strides: self.strides.clone(),
            });
        }
        Ok(())
    }
}

/// Axes of extent 0 or 1 never step, so their stride is irrelevant. An array with a
/// zero-length axis addresses no elements and is trivially row-major; `ndarray` reports
/// all-zero strides for such arrays.
fn is_row_major(shape: &[usize], strides: &[isize]) -> bool {
    if shape.len() != strides.len() {
        return false;
    }
    if shape.contains(&0) {
        return true;
    }
    let mut step = 1isize;
    for (&extent, &stride) in shape.iter().zip(strides).rev() {
        if extent > 1 && stride != step {
            return false;
        }
        step *= extent.max(1) as isize;
    }
    true
}

impl<'a, T: Element, D: Dimension> From<ArrayView<'a, T, D>> for Buffer<'a> {
    fn from(view: ArrayView<'a, T, D>) -> Self {
        Self {
            ptr: view.as_ptr() as *mut u8,
            dtype: T::DTYPE,
            shape: view.shape().to_vec(),
            strides: view.strides().to_vec(),
            writable: false,
            marker: PhantomData,
        }
    }
}

impl<'a, T: Element, D: Dimension> From<ArrayViewMut<'a, T, D>> for Buffer<'a> {
    fn from(mut view: ArrayViewMut<'a, T, D>) -> Self {
        Self {
            ptr: view.as_mut_ptr().cast::<u8>(),
            dtype: T::DTYPE,
            shape: view.shape().to_vec(),
            strides: view.strides().to_vec(),
            writable: true,
            marker: PhantomData,
        }
    }
}

/// A validated, contiguous, read-only typed view.
#[derive(Debug)]
pub struct View<'a, T> {
    ptr: *const T,
    shape: Vec<usize>,
    marker: PhantomData<&'a [T]>,
}

impl<'a, T: Element> View<'a, T> {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        if self.is_empty() {
            return &[];
        }
        // SAFETY: validation established a contiguous row-major layout of `len()`
        // elements borrowed for `'a`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len()) }
    }
}

/// A validated, contiguous, writable typed view.
#[derive(Debug)]
pub struct ViewMut<'a, T> {
    ptr: *mut T,
    shape: Vec<usize>,
    marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: Element> ViewMut<'a, T> {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn into_slice(self) -> &'a mut [T] {
        if self.is_empty() {
            return &mut [];
        }
        // SAFETY: as for `View::as_slice`; the view was produced from a writable buffer
        // consumed by `extract_mut`, so this is the only mutable path to the memory.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, s};

    #[test]
    fn extract_reports_actual_shape() {
        let data = vec![0.0f64; 12];
        let buffer = Buffer::from_slice(&data, &[3, 4]).unwrap();
        let view = buffer.extract::<f64>("boresight", &[-1, 4]).unwrap();
        assert_eq!(view.shape(), &[3, 4]);
        assert_eq!(view.as_slice().len(), 12);
    }

    #[test]
    fn wrong_element_type_is_a_type_mismatch() {
        let data = vec![0i32; 4];
        let buffer = Buffer::from_slice(&data, &[4]).unwrap();
        let err = buffer.extract::<f64>("focalplane", &[-1]).unwrap_err();
        assert_eq!(
            err,
            BufferError::TypeMismatch {
                name: "focalplane".to_string(),
                expected: DType::F64,
                found: DType::I32,
            }
        );
    }

    #[test]
    fn wrong_rank_or_extent_is_a_shape_mismatch() {
        let data = vec![0.0f64; 8];
        let buffer = || Buffer::from_slice(&data, &[2, 4]).unwrap();

        let err = buffer().extract::<f64>("quats", &[-1, 2, 4]).unwrap_err();
        assert!(matches!(err, BufferError::ShapeMismatch { .. }));

        let err = buffer().extract::<f64>("focalplane", &[3, 4]).unwrap_err();
        assert_eq!(
            err,
            BufferError::ShapeMismatch {
                name: "focalplane".to_string(),
                expected: vec![3, 4],
                found: vec![2, 4],
            }
        );

        assert!(buffer().extract::<f64>("focalplane", &[2, 4]).is_ok());
    }

    #[test]
    fn transposed_ndarray_view_is_a_stride_error() {
        let array = Array2::<f64>::zeros((4, 3));
        let buffer = Buffer::from(array.t());
        let err = buffer.extract::<f64>("boresight", &[-1, 4]).unwrap_err();
        assert!(matches!(err, BufferError::Stride { .. }), "{err}");
    }

    #[test]
    fn stepped_slice_is_a_stride_error() {
        let array = Array2::<f64>::zeros((8, 4));
        let buffer = Buffer::from(array.slice(s![..;2, ..]));
        let err = buffer.extract::<f64>("boresight", &[-1, 4]).unwrap_err();
        assert!(matches!(err, BufferError::Stride { .. }));
    }

    #[test]
    fn unit_axes_do_not_constrain_strides() {
        let array = Array3::<f64>::zeros((5, 1, 4));
        let buffer = Buffer::from(array.slice(s![1..2, .., ..]));
        let view = buffer.extract::<f64>("quats", &[-1, 1, 4]).unwrap();
        assert_eq!(view.shape(), &[1, 1, 4]);
    }

    #[test]
    fn read_only_buffers_cannot_be_outputs() {
        let data = vec![0.0f64; 4];
        let buffer = Buffer::from_slice(&data, &[1, 1, 4]).unwrap();
        let err = buffer.extract_mut::<f64>("quats", &[-1, 1, 4]).unwrap_err();
        assert_eq!(
            err,
            BufferError::ReadOnly {
                name: "quats".to_string()
            }
        );
    }

    #[test]
    fn mutable_views_write_through_to_the_caller() {
        let mut array = Array3::<f64>::zeros((2, 3, 4));
        {
            let buffer = Buffer::from(array.view_mut());
            let view = buffer.extract_mut::<f64>("quats", &[2, 3, 4]).unwrap();
            let slice = view.into_slice();
            slice[23] = 7.5;
        }
        assert_eq!(array[[1, 2, 3]], 7.5);
    }

    #[test]
    fn slice_length_must_match_shape() {
        let data = vec![0u8; 5];
        let err = Buffer::from_slice(&data, &[2, 2]).unwrap_err();
        assert_eq!(
            err,
            BufferError::Length {
                len: 5,
                shape: vec![2, 2]
            }
        );
    }

    #[test]
    fn interval_tables_carry_their_own_type_tag() {
        let intervals = vec![Interval::new(0, 3), Interval::new(5, 9)];
        let err = Buffer::from_slice(&intervals, &[2])
            .unwrap()
            .extract::<i64>("intervals", &[-1])
            .unwrap_err();
        assert!(matches!(
            err,
            BufferError::TypeMismatch {
                found: DType::Interval,
                ..
            }
        ));

        let buffer = Buffer::from_slice(&intervals, &[2]).unwrap();
        let view = buffer.extract::<Interval>("intervals", &[-1]).unwrap();
        assert_eq!(view.as_slice()[1], Interval::new(5, 9));
    }

    #[test]
    fn arrays_with_an_empty_axis_pass_the_layout_check() {
        let focalplane = Array2::<f64>::zeros((0, 4));
        let view = Buffer::from(focalplane.view())
            .extract::<f64>("focalplane", &[0, 4])
            .unwrap();
        assert!(view.as_slice().is_empty());

        let mut quats = Array3::<f64>::zeros((2, 0, 4));
        let view = Buffer::from(quats.view_mut())
            .extract_mut::<f64>("quats", &[-1, 0, 4])
            .unwrap();
        assert_eq!(view.shape(), &[2, 0, 4]);
        assert!(view.into_slice().is_empty());

        assert!(is_row_major(&[0, 4], &[0, 0]));
        assert!(!is_row_major(&[0, 4], &[0]));
    }

    #[test]
    fn raw_contiguous_buffers_extract_in_place() {
        let mut data: Vec<f64> = (0..12).map(f64::from).collect();
        // SAFETY: `data` holds 12 f64 in row-major [3, 4] order and outlives the buffer.
        let buffer = unsafe {
            Buffer::from_raw_parts(
                data.as_mut_ptr().cast::<u8>(),
                DType::F64,
                vec![3, 4],
                vec![4, 1],
                true,
            )
        };
        let view = buffer.extract_mut::<f64>("quats", &[3, 4]).unwrap();
        let slice = view.into_slice();
        assert_eq!(slice[5], 5.0);
        slice[11] = -1.0;
        assert_eq!(data[11], -1.0);
    }

    #[test]
    fn raw_buffers_with_a_non_unit_stride_are_rejected() {
        let mut data = vec![0.0f64; 16];
        // SAFETY: every index reachable through shape [2, 4] and strides [8, 2] is
        // inside the 16 elements of `data`.
        let buffer = unsafe {
            Buffer::from_raw_parts(
                data.as_mut_ptr().cast::<u8>(),
                DType::F64,
                vec![2, 4],
                vec![8, 2],
                false,
            )
        };
        let err = buffer.extract::<f64>("boresight", &[-1, 4]).unwrap_err();
        assert_eq!(
            err,
            BufferError::Stride {
                name: "boresight".to_string(),
                shape: vec![2, 4],
                strides: vec![8, 2],
            }
        );
    }

    #[test]
    fn raw_buffers_of_the_wrong_rank_are_rejected() {
        let mut data = vec![0i32; 6];
        // SAFETY: shape [6] with unit stride covers exactly `data`.
        let buffer = unsafe {
            Buffer::from_raw_parts(data.as_mut_ptr().cast::<u8>(), DType::I32, vec![6], vec![1], false)
        };
        let err = buffer.extract::<i32>("quat_index", &[2, 3]).unwrap_err();
        assert_eq!(
            err,
            BufferError::ShapeMismatch {
                name: "quat_index".to_string(),
                expected: vec![2, 3],
                found: vec![6],
            }
        );
    }
}
