// ========================================================================================
//
//                      The kernel: detector pointing, written once
//
// ========================================================================================
//
// This module holds the innermost arithmetic of the engine and the single loop nest that
// drives it. The same loop nest is launched by two execution models: on the host it runs
// on the ambient rayon pool over host memory, and on the device it runs on the device
// teams over device memory. Nothing here knows which one it is running under.
//
// The parallel domain is the collapsed (detector, interval) space. Within each element
// of that domain the interval's samples are themselves split across workers. Every
// iteration writes the four components of exactly one output quaternion, and no
// intermediate storage is allocated anywhere in the hot path.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use crate::accel::DeviceScope;
use crate::intervals::Interval;
use crate::qarray::{self, IDENTITY, Quat};

const _: () = assert!(std::mem::size_of::<f64>() == std::mem::size_of::<AtomicU64>());
const _: () = assert!(std::mem::align_of::<f64>() == std::mem::align_of::<AtomicU64>());

/// The read-only operands of one launch, all resident in the memory space the launch
/// executes in. Array layouts are the flattened row-major forms of
/// `focalplane[n_det, 4]`, `boresight[n_samp, 4]`, `q_index[n_det]`,
/// `intervals[n_view]` and `flags[n_samp]`.
#[derive(Debug, Clone, Copy)]
pub struct PointingInputs<'a> {
    pub focalplane: &'a [f64],
    pub boresight: &'a [f64],
    pub q_index: &'a [i32],
    pub intervals: &'a [Interval],
    pub flags: &'a [u8],
    pub mask: u8,
    pub n_samp: usize,
}

impl PointingInputs<'_> {
    #[inline]
    pub fn n_det(&self) -> usize {
        self.q_index.len()
    }

    #[inline]
    pub fn n_view(&self) -> usize {
        self.intervals.len()
    }
}

/// Shared write access to the `[n_slot, n_samp, 4]` output quaternions.
///
/// Each component is stored with a relaxed atomic store of its bit pattern. On every
/// target this engine supports that is an ordinary 8-byte store, and it keeps
/// overlapping intervals or repeated slot indices well defined: the last writer wins.
pub struct OutputQuats<'a> {
    ptr: *mut f64,
    len: usize,
    marker: PhantomData<&'a mut [f64]>,
}

// SAFETY: all writes go through atomic stores, and the exclusive borrow taken in `new`
// guarantees nothing else reads or writes the memory while the handle exists.
unsafe impl Send for OutputQuats<'_> {}
unsafe impl Sync for OutputQuats<'_> {}

impl<'a> OutputQuats<'a> {
    pub fn new(quats: &'a mut [f64]) -> Self {
        Self {
            ptr: quats.as_mut_ptr(),
            len: quats.len(),
            marker: PhantomData,
        }
    }

    /// Writes `q` at element offset `offset`.
    ///
    /// # Panics
    /// If `offset + 4` exceeds the output length.
    #[inline(always)]
    pub fn store(&self, offset: usize, q: &Quat) {
        assert!(offset + 4 <= self.len, "output quaternion offset out of bounds");
        for (component, value) in q.iter().enumerate() {
            // SAFETY: in bounds by the assertion above; `f64` and `AtomicU64` have the
            // same size and alignment, and every concurrent access is atomic.
            let cell = unsafe { AtomicU64::from_ptr(self.ptr.add(offset + component).cast::<u64>()) };
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Computes the pointing of detector `idet` at sample `isamp`.
///
/// A sample whose flags intersect the mask keeps the focal-plane offset alone: the
/// boresight is replaced by the identity rotation.
#[inline(always)]
pub fn pointing_detector_inner(
    inputs: &PointingInputs,
    out: &OutputQuats,
    idet: usize,
    isamp: usize,
) {
    let slot = inputs.q_index[idet] as usize;

    let bore: Quat = if inputs.flags[isamp] & inputs.mask == 0 {
        let b = 4 * isamp;
        [
            inputs.boresight[b],
            inputs.boresight[b + 1],
            inputs.boresight[b + 2],
            inputs.boresight[b + 3],
        ]
    } else {
        IDENTITY
    };

    let f = 4 * idet;
    let offset = [
        inputs.focalplane[f],
        inputs.focalplane[f + 1],
        inputs.focalplane[f + 2],
        inputs.focalplane[f + 3],
    ];

    let mut detector = [0.0; 4];
    qarray::mult(&bore, &offset, &mut detector);
    out.store(4 * (slot * inputs.n_samp + isamp), &detector);
}

/// The loop nest shared by both launchers. Runs on whichever rayon pool is current.
///
/// Interval endpoints and slot indices must already be validated against `n_samp`
/// and the output length; a violation panics instead of writing out of bounds.
fn pointing_detector_loop(inputs: &PointingInputs, out: &OutputQuats) {
    let n_view = inputs.n_view();
    (0..inputs.n_det() * n_view)
        .into_par_iter()
        .for_each(|task| {
            let idet = task / n_view;
            let view = inputs.intervals[task % n_view];
            if view.is_empty() {
                return;
            }
            (view.first as usize..=view.last as usize)
                .into_par_iter()
                .for_each(|isamp| pointing_detector_inner(inputs, out, idet, isamp));
        });
}

/// Host launch: the ambient thread pool over host memory.
pub fn run_host(inputs: &PointingInputs, out: &OutputQuats) {
    pointing_detector_loop(inputs, out);
}

/// Device launch: the device teams over device memory. `inputs` and `out` must
/// address memory resolved or mapped through `scope`.
pub fn run_device(scope: &DeviceScope<'_>, inputs: &PointingInputs, out: &OutputQuats) {
    scope.install(|| pointing_detector_loop(inputs, out));
}
