//! Constant-velocity Kalman filter over `[x, y, w, h, vx, vy, vw, vh]`
//!
//! Pure functions over an explicit state: `predict` and `update` take a state
//! by reference and return the next one.

/// Process noise on position components
pub const Q_POSITION: f64 = 0.01;
/// Process noise on velocity components
pub const Q_VELOCITY: f64 = 1.0;
/// Measurement noise
pub const R_MEASUREMENT: f64 = 0.05;

const INITIAL_POSITION_VARIANCE: f64 = 10.0;
const INITIAL_VELOCITY_VARIANCE: f64 = 100.0;

pub type Vec8 = [f64; 8];
pub type Mat8 = [[f64; 8]; 8];
type Mat4 = [[f64; 4]; 4];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanState {
    pub x: Vec8,
    pub p: Mat8,
}

impl KalmanState {
    /// Start at a measured box with zero velocity
    pub fn from_measurement(z: [f64; 4]) -> Self {
        let mut x = [0.0; 8];
        x[..4].copy_from_slice(&z);
        let mut p = [[0.0; 8]; 8];
        for (i, row) in p.iter_mut().enumerate() {
            row[i] = if i < 4 {
                INITIAL_POSITION_VARIANCE
            } else {
                INITIAL_VELOCITY_VARIANCE
            };
        }
        Self { x, p }
    }

    pub fn position(&self) -> [f64; 4] {
        [self.x[0], self.x[1], self.x[2], self.x[3]]
    }

    pub fn velocity(&self) -> [f64; 4] {
        [self.x[4], self.x[5], self.x[6], self.x[7]]
    }
}

/// Time update: `x(t) = x(t-1) + v(t-1)·dt`, velocity held constant
pub fn predict(state: &KalmanState, dt: f64) -> KalmanState {
    let mut x = state.x;
    for i in 0..4 {
        x[i] += state.x[i + 4] * dt;
    }

    // P' = F P F^T + Q with F = [[I, dt I], [0, I]]
    let p = &state.p;
    let mut fp = *p;
    for i in 0..4 {
        for j in 0..8 {
            fp[i][j] = p[i][j] + dt * p[i + 4][j];
        }
    }
    let mut next = fp;
    for i in 0..8 {
        for j in 0..4 {
            next[i][j] = fp[i][j] + dt * fp[i][j + 4];
        }
    }
    for (i, row) in next.iter_mut().enumerate() {
        row[i] += if i < 4 { Q_POSITION } else { Q_VELOCITY };
    }

    KalmanState { x, p: next }
}

/// Measurement update with an observed box `z = [x, y, w, h]`
pub fn update(state: &KalmanState, z: [f64; 4]) -> KalmanState {
    let p = &state.p;

    // S = H P H^T + R, the top-left 4x4 block plus noise
    let mut s: Mat4 = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            s[i][j] = p[i][j];
        }
        s[i][i] += R_MEASUREMENT;
    }
    let Some(s_inv) = invert4(&s) else {
        return *state;
    };

    // K = P H^T S^-1, the first four columns of P times S^-1
    let mut k = [[0.0; 4]; 8];
    for i in 0..8 {
        for j in 0..4 {
            k[i][j] = (0..4).map(|m| p[i][m] * s_inv[m][j]).sum();
        }
    }

    let innovation: [f64; 4] = std::array::from_fn(|i| z[i] - state.x[i]);
    let mut x = state.x;
    for i in 0..8 {
        x[i] += (0..4).map(|j| k[i][j] * innovation[j]).sum::<f64>();
    }

    // P' = (I - K H) P
    let mut next = *p;
    for i in 0..8 {
        for j in 0..8 {
            next[i][j] = p[i][j] - (0..4).map(|m| k[i][m] * p[m][j]).sum::<f64>();
        }
    }

    KalmanState { x, p: next }
}

/// Gauss-Jordan inverse with partial pivoting
fn invert4(m: &Mat4) -> Option<Mat4> {
    let mut a = *m;
    let mut inv: Mat4 = [[0.0; 4]; 4];
    for (i, row) in inv.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for col in 0..4 {
        let pivot = (col..4).max_by(|&r1, &r2| {
            a[r1][col]
                .abs()
                .partial_cmp(&a[r2][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let d = a[col][col];
        for j in 0..4 {
            a[col][j] /= d;
            inv[col][j] /= d;
        }
        for r in 0..4 {
            if r != col {
                let f = a[r][col];
                if f != 0.0 {
                    for j in 0..4 {
                        a[r][j] -= f * a[col][j];
                        inv[r][j] -= f * inv[col][j];
                    }
                }
            }
        }
    }
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_predict_constant_velocity() {
        let mut state = KalmanState::from_measurement([10.0, 20.0, 30.0, 40.0]);
        state.x[4] = 2.0;
        state.x[5] = -1.0;
        let next = predict(&state, 1.0);
        assert_eq!(next.position(), [12.0, 19.0, 30.0, 40.0]);
        assert_eq!(next.velocity(), state.velocity());
    }

    #[test]
    fn test_predict_grows_uncertainty() {
        let state = KalmanState::from_measurement([0.0; 4]);
        let next = predict(&state, 1.0);
        assert!(next.p[0][0] > state.p[0][0]);
        assert!(next.p[4][4] > state.p[4][4]);
    }

    #[test]
    fn test_update_pulls_toward_measurement() {
        let state = predict(&KalmanState::from_measurement([0.0; 4]), 1.0);
        let next = update(&state, [10.0, 0.0, 0.0, 0.0]);
        assert!(next.x[0] > 9.0 && next.x[0] <= 10.0);
        assert!(next.p[0][0] < state.p[0][0]);
    }

    #[test]
    fn test_learns_velocity_from_measurements() {
        let mut state = KalmanState::from_measurement([0.0, 0.0, 10.0, 10.0]);
        for t in 1..20 {
            state = predict(&state, 1.0);
            state = update(&state, [3.0 * t as f64, 0.0, 10.0, 10.0]);
        }
        assert!((state.x[4] - 3.0).abs() < 0.2, "vx = {}", state.x[4]);
    }

    #[test]
    fn test_invert4_identity() {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 2.0;
        }
        let inv = invert4(&m).unwrap();
        assert_eq!(inv[2][2], 0.5);
        assert!(invert4(&[[0.0; 4]; 4]).is_none());
    }

    proptest! {
        #[test]
        fn prop_covariance_stays_symmetric(
            z in prop::array::uniform4(-500.0f64..500.0),
            steps in 1usize..30,
        ) {
            let mut state = KalmanState::from_measurement([0.0, 0.0, 20.0, 20.0]);
            for i in 0..steps {
                state = predict(&state, 1.0);
                if i % 3 == 0 {
                    state = update(&state, z);
                }
            }
            for i in 0..8 {
                prop_assert!(state.p[i][i] > 0.0);
                for j in 0..8 {
                    let tol = 1e-6 * (1.0 + state.p[i][j].abs());
                    prop_assert!((state.p[i][j] - state.p[j][i]).abs() < tol);
                }
            }
        }
    }
}
