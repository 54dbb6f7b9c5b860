// ========================================================================================
//
//                      Dispatch: from caller buffers to a kernel launch
//
// ========================================================================================
//
// `pointing_detector` is the public entry point of the engine. It validates every
// buffer in a fixed order, so the first offending buffer is always the one reported,
// checks the index tables against the extents it just learned, and only then decides
// where to run. Nothing is written to the output unless every check has passed.

use log::debug;
use thiserror::Error;

use crate::accel::{AccelError, AccelManager};
use crate::buffer::{Buffer, BufferError};
use crate::intervals::{self, Interval};
use crate::kernel::{self, OutputQuats, PointingInputs};

#[derive(Debug, Error)]
pub enum PointingError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Accel(#[from] AccelError),
    #[error("detector {det} targets output slot {slot}, but the output has {n_slot} slots")]
    SlotOutOfRange { det: usize, slot: i32, n_slot: usize },
    #[error("interval {view} spans samples [{first}, {last}], outside [0, {n_samp})")]
    IntervalOutOfRange {
        view: usize,
        first: i64,
        last: i64,
        n_samp: usize,
    },
}

/// Every operand of one call, validated and typed.
struct Operands<'a> {
    focalplane: &'a [f64],
    boresight: &'a [f64],
    q_index: &'a [i32],
    quats: &'a mut [f64],
    intervals: &'a [Interval],
    flags: &'a [u8],
    n_samp: usize,
}

impl Operands<'_> {
    fn is_noop(&self) -> bool {
        self.q_index.is_empty() || self.n_samp == 0 || self.intervals.is_empty()
    }
}

fn validate<'a>(
    focalplane: Buffer<'a>,
    boresight: Buffer<'a>,
    quat_index: Buffer<'a>,
    quats: Buffer<'a>,
    intervals: Buffer<'a>,
    shared_flags: Buffer<'a>,
) -> Result<Operands<'a>, PointingError> {
    let q_index = quat_index.extract::<i32>("quat_index", &[-1])?;
    let n_det = q_index.shape()[0];

    let focalplane = focalplane.extract::<f64>("focalplane", &[n_det as i64, 4])?;

    let boresight = boresight.extract::<f64>("boresight", &[-1, 4])?;
    let n_samp = boresight.shape()[0];

    let quats = quats.extract_mut::<f64>("quats", &[-1, n_samp as i64, 4])?;
    let n_slot = quats.shape()[0];

    let intervals = intervals.extract::<Interval>("intervals", &[-1])?;

    let flags = shared_flags.extract::<u8>("flags", &[n_samp as i64])?;

    let q_index = q_index.as_slice();
    let intervals = intervals.as_slice();
    let operands = Operands {
        focalplane: focalplane.as_slice(),
        boresight: boresight.as_slice(),
        q_index,
        quats: quats.into_slice(),
        intervals,
        flags: flags.as_slice(),
        n_samp,
    };
    if operands.is_noop() {
        return Ok(operands);
    }

    if let Some((det, &slot)) = q_index
        .iter()
        .enumerate()
        .find(|&(_, &slot)| slot < 0 || slot as usize >= n_slot)
    {
        return Err(PointingError::SlotOutOfRange { det, slot, n_slot });
    }

    if let Some((view, bad)) = intervals::find_out_of_bounds(intervals, n_samp) {
        return Err(PointingError::IntervalOutOfRange {
            view,
            first: bad.first,
            last: bad.last,
            n_samp,
        });
    }
    Ok(operands)
}

/// Computes detector quaternions `quats[q_index[d], s] = boresight[s] * focalplane[d]`
/// for every detector `d` and every sample `s` inside `intervals`, using the
/// process-wide device manager.
///
/// Expected layouts: `focalplane` f64 `[n_det, 4]`, `boresight` f64 `[n_samp, 4]`,
/// `quat_index` i32 `[n_det]`, `quats` f64 `[n_slot, n_samp, 4]` (written in place),
/// `intervals` [`Interval`] `[n_view]`, `shared_flags` u8 `[n_samp]`. Samples whose flags
/// intersect `shared_flag_mask` receive the focal-plane quaternion unchanged; samples
/// outside every interval are left untouched.
///
/// With `use_accel` and a device selected, `boresight`, `quats`, `intervals` and
/// `shared_flags` must already be present on the device, and the result is written to
/// the device mirror of `quats`.
#[allow(clippy::too_many_arguments)]
pub fn pointing_detector(
    focalplane: Buffer<'_>,
    boresight: Buffer<'_>,
    quat_index: Buffer<'_>,
    quats: Buffer<'_>,
    intervals: Buffer<'_>,
    shared_flags: Buffer<'_>,
    shared_flag_mask: u8,
    use_accel: bool,
) -> Result<(), PointingError> {
    let operands = validate(
        focalplane,
        boresight,
        quat_index,
        quats,
        intervals,
        shared_flags,
    )?;
    launch(AccelManager::get()?, operands, shared_flag_mask, use_accel)
}

/// [`pointing_detector`] against an explicit device manager.
#[allow(clippy::too_many_arguments)]
pub fn pointing_detector_with(
    manager: &AccelManager,
    focalplane: Buffer<'_>,
    boresight: Buffer<'_>,
    quat_index: Buffer<'_>,
    quats: Buffer<'_>,
    intervals: Buffer<'_>,
    shared_flags: Buffer<'_>,
    shared_flag_mask: u8,
    use_accel: bool,
) -> Result<(), PointingError> {
    let operands = validate(
        focalplane,
        boresight,
        quat_index,
        quats,
        intervals,
        shared_flags,
    )?;
    launch(manager, operands, shared_flag_mask, use_accel)
}

fn launch(
    manager: &AccelManager,
    operands: Operands<'_>,
    mask: u8,
    use_accel: bool,
) -> Result<(), PointingError> {
    let device = manager.get_device();
    let offload = use_accel && !manager.device_is_host();
    debug!(
        "pointing_detector: n_det={} n_samp={} n_view={} offload={offload} device={device}",
        operands.q_index.len(),
        operands.n_samp,
        operands.intervals.len(),
    );

    if operands.is_noop() {
        return Ok(());
    }

    if !offload {
        let inputs = PointingInputs {
            focalplane: operands.focalplane,
            boresight: operands.boresight,
            q_index: operands.q_index,
            intervals: operands.intervals,
            flags: operands.flags,
            mask,
            n_samp: operands.n_samp,
        };
        kernel::run_host(&inputs, &OutputQuats::new(operands.quats));
        return Ok(());
    }

    let scope = manager.target_scope()?;
    let boresight = scope.resolve(operands.boresight)?;
    let quats = scope.resolve_mut(operands.quats)?;
    let intervals = scope.resolve(operands.intervals)?;
    let flags = scope.resolve(operands.flags)?;
    let focalplane = scope.map_to(operands.focalplane);
    let q_index = scope.map_to(operands.q_index);

    let inputs = PointingInputs {
        focalplane: focalplane.as_slice(),
        boresight,
        q_index: q_index.as_slice(),
        intervals,
        flags,
        mask,
        n_samp: operands.n_samp,
    };
    debug!(
        "pointing_detector: launching {} tasks on {} device teams",
        inputs.n_det() * inputs.n_view(),
        scope.n_teams()
    );
    kernel::run_device(&scope, &inputs, &OutputQuats::new(quats));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccelConfig;

    fn host() -> AccelManager {
        AccelManager::new(AccelConfig::default()).unwrap()
    }

    #[test]
    fn buffers_are_validated_in_a_fixed_order() {
        let focalplane = vec![0.0f64; 8];
        let boresight = vec![0.0f64; 12];
        let q_index = vec![0.0f64; 2];
        let mut quats = vec![0.0f64; 24];
        let intervals = vec![Interval::new(0, 2)];
        let flags = vec![0u8; 2];

        // Both `quat_index` (wrong type) and `flags` (wrong extent) are invalid; the
        // index table is checked first.
        let err = pointing_detector_with(
            &host(),
            Buffer::from_slice(&focalplane, &[2, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[3, 4]).unwrap(),
            Buffer::from_slice(&q_index, &[2]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[2, 3, 4]).unwrap(),
            Buffer::from_slice(&intervals, &[1]).unwrap(),
            Buffer::from_slice(&flags, &[2]).unwrap(),
            1,
            false,
        )
        .unwrap_err();
        match err {
            PointingError::Buffer(BufferError::TypeMismatch { name, .. }) => {
                assert_eq!(name, "quat_index")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn flags_must_match_the_boresight_length() {
        let focalplane = vec![0.0f64; 4];
        let boresight = vec![0.0f64; 12];
        let q_index = vec![0i32];
        let mut quats = vec![0.0f64; 12];
        let intervals = vec![Interval::new(0, 2)];
        let flags = vec![0u8; 2];

        let err = pointing_detector_with(
            &host(),
            Buffer::from_slice(&focalplane, &[1, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[3, 4]).unwrap(),
            Buffer::from_slice(&q_index, &[1]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[1, 3, 4]).unwrap(),
            Buffer::from_slice(&intervals, &[1]).unwrap(),
            Buffer::from_slice(&flags, &[2]).unwrap(),
            1,
            false,
        )
        .unwrap_err();
        match err {
            PointingError::Buffer(BufferError::ShapeMismatch { name, expected, .. }) => {
                assert_eq!(name, "flags");
                assert_eq!(expected, vec![3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slot_and_interval_bounds_are_checked_before_any_write() {
        let focalplane = vec![0.0, 0.0, 0.0, 1.0];
        let boresight = vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let flags = vec![0u8; 2];
        let mut quats = vec![5.0f64; 8];

        let err = pointing_detector_with(
            &host(),
            Buffer::from_slice(&focalplane, &[1, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[2, 4]).unwrap(),
            Buffer::from_slice(&[1i32], &[1]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[1, 2, 4]).unwrap(),
            Buffer::from_slice(&[Interval::new(0, 1)], &[1]).unwrap(),
            Buffer::from_slice(&flags, &[2]).unwrap(),
            1,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PointingError::SlotOutOfRange { det: 0, slot: 1, n_slot: 1 }
        ));

        let views = [Interval::new(0, 0), Interval::new(1, 2)];
        let err = pointing_detector_with(
            &host(),
            Buffer::from_slice(&focalplane, &[1, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[2, 4]).unwrap(),
            Buffer::from_slice(&[0i32], &[1]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[1, 2, 4]).unwrap(),
            Buffer::from_slice(&views, &[2]).unwrap(),
            Buffer::from_slice(&flags, &[2]).unwrap(),
            1,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PointingError::IntervalOutOfRange { view: 1, first: 1, last: 2, n_samp: 2 }
        ));
        assert_eq!(quats, vec![5.0; 8]);
    }

    #[test]
    fn offload_requires_registered_buffers() {
        let manager = AccelManager::new(AccelConfig::emulated(1)).unwrap();
        let focalplane = vec![0.0, 0.0, 0.0, 1.0];
        let boresight = vec![0.0, 0.0, 0.0, 1.0];
        let intervals = vec![Interval::new(0, 0)];
        let flags = vec![0u8];
        let mut quats = vec![3.0f64; 4];

        manager.create(&boresight).unwrap();
        manager.create(&intervals).unwrap();
        manager.create(&flags).unwrap();

        let err = pointing_detector_with(
            &manager,
            Buffer::from_slice(&focalplane, &[1, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[1, 4]).unwrap(),
            Buffer::from_slice(&[0i32], &[1]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[1, 1, 4]).unwrap(),
            Buffer::from_slice(&intervals, &[1]).unwrap(),
            Buffer::from_slice(&flags, &[1]).unwrap(),
            1,
            true,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PointingError::Accel(AccelError::NotPresent { .. })
        ));
        assert_eq!(quats, vec![3.0; 4]);
    }

    #[test]
    fn empty_interval_tables_are_a_noop() {
        let focalplane = vec![0.0, 0.0, 0.0, 1.0];
        let boresight = vec![0.0, 0.0, 0.0, 1.0];
        let intervals: Vec<Interval> = Vec::new();
        let mut quats = vec![3.0f64; 4];

        pointing_detector_with(
            &host(),
            Buffer::from_slice(&focalplane, &[1, 4]).unwrap(),
            Buffer::from_slice(&boresight, &[1, 4]).unwrap(),
            Buffer::from_slice(&[0i32], &[1]).unwrap(),
            Buffer::from_slice_mut(&mut quats, &[1, 1, 4]).unwrap(),
            Buffer::from_slice(&intervals, &[0]).unwrap(),
            Buffer::from_slice(&[0u8], &[1]).unwrap(),
            1,
            true,
        )
        .unwrap();
        assert_eq!(quats, vec![3.0; 4]);
    }
}
