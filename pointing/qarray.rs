// ========================================================================================
//
//                      Quaternion primitives for the pointing kernel
//
// ========================================================================================
//
// Quaternions are stored as `[x, y, z, w]`, with the scalar component last. The host
// launcher and the device launcher inline the same `mult`, so both paths perform the
// same floating-point operations in the same order.

/// A quaternion laid out as `[x, y, z, w]`.
pub type Quat = [f64; 4];

/// The identity rotation.
pub const IDENTITY: Quat = [0.0, 0.0, 0.0, 1.0];

/// Hamilton product `r = p * q`.
///
/// The output cannot alias either input: the borrow checker rejects a call that
/// passes the same quaternion as `r` and as `p` or `q`.
#[inline(always)]
pub fn mult(p: &Quat, q: &Quat, r: &mut Quat) {
    r[0] = p[3] * q[0] + p[0] * q[3] + p[1] * q[2] - p[2] * q[1];
    r[1] = p[3] * q[1] - p[0] * q[2] + p[1] * q[3] + p[2] * q[0];
    r[2] = p[3] * q[2] + p[0] * q[1] - p[1] * q[0] + p[2] * q[3];
    r[3] = p[3] * q[3] - p[0] * q[0] - p[1] * q[1] - p[2] * q[2];
}

/// Rotates the 3-vector `v` by the unit quaternion `q`, writing `q v q*` into `out`.
///
/// `q` is assumed to be normalized; no normalization is performed here.
#[inline(always)]
pub fn rotate(q: &Quat, v: &[f64; 3], out: &mut [f64; 3]) {
    let xw = q[3] * q[0];
    let yw = q[3] * q[1];
    let zw = q[3] * q[2];
    let x2 = -q[0] * q[0];
    let xy = q[0] * q[1];
    let xz = q[0] * q[2];
    let y2 = -q[1] * q[1];
    let yz = q[1] * q[2];
    let z2 = -q[2] * q[2];

    out[0] = 2.0 * ((y2 + z2) * v[0] + (xy - zw) * v[1] + (yw + xz) * v[2]) + v[0];
    out[1] = 2.0 * ((zw + xy) * v[0] + (x2 + z2) * v[1] + (yz - xw) * v[2]) + v[1];
    out[2] = 2.0 * ((xz - yw) * v[0] + (xw + yz) * v[1] + (x2 + y2) * v[2]) + v[2];
}
