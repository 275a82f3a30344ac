//! Piecewise normalisers mapping physical quantities onto [0,1] stress.
//!
//! Every curve is total: missing or NaN input takes the documented default
//! before evaluation. Breakpoints belong to the lower bucket.

/// Below this speed a vehicle is dwelling, not congested.
pub const DWELL_SPEED_KPH: f64 = 5.0;
/// Floor applied to the free-flow denominator.
pub const MIN_FREE_KPH: f64 = 1e-3;
/// Rain rate giving full rain stress.
pub const RAIN_SATURATION_MM: f64 = 3.0;
/// Temperature assumed when the heat curve has no reading.
pub const HEAT_COMFORT_C: f64 = 18.0;
/// Temperature assumed when the cold curve has no reading.
pub const COLD_COMFORT_C: f64 = 15.0;

fn present(v: Option<f64>) -> Option<f64> {
    v.filter(|x| !x.is_nan())
}

fn unit(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Delay in seconds → stress. 0.30 at 5 min, 0.70 at 15 min, 1.00 from 60 min.
pub fn delay_norm_value(delay_sec: Option<f64>) -> f64 {
    let d = present(delay_sec).unwrap_or(0.0) / 60.0;
    let v = if d <= 5.0 {
        0.30 * (d / 5.0)
    } else if d <= 15.0 {
        0.30 + 0.40 * ((d - 5.0) / 10.0)
    } else {
        0.70 + 0.30 * ((d - 15.0).min(45.0) / 45.0)
    };
    unit(v)
}

/// Congestion relative to free flow. Dwelling or unknown speed is zero; a
/// moving vehicle with no free-flow reference has no value.
pub fn speed_norm_value(speed_kph: Option<f64>, free_kph: Option<f64>) -> Option<f64> {
    match present(speed_kph) {
        Some(speed) if speed >= DWELL_SPEED_KPH => {
            let free = present(free_kph)?;
            Some(unit(1.0 - speed / free.max(MIN_FREE_KPH)))
        }
        _ => Some(0.0),
    }
}

pub fn rain_norm_value(rain_mm: Option<f64>) -> f64 {
    unit(present(rain_mm).unwrap_or(0.0) / RAIN_SATURATION_MM)
}

/// 0 up to 18 °C, then 0.30 at 21, 0.70 at 24, 1.00 from 27.
pub fn heat_norm_value(temp_c: Option<f64>) -> f64 {
    let t = present(temp_c).unwrap_or(HEAT_COMFORT_C);
    if t <= 18.0 {
        0.0
    } else if t <= 21.0 {
        0.30 * (t - 18.0) / 3.0
    } else if t <= 24.0 {
        0.30 + 0.40 * (t - 21.0) / 3.0
    } else if t <= 27.0 {
        0.70 + 0.30 * (t - 24.0) / 3.0
    } else {
        1.0
    }
}

/// 0 from 10 °C, then 0.30 at 5, 0.70 at 0, 1.00 at -5 and below.
pub fn cold_norm_value(temp_c: Option<f64>) -> f64 {
    let t = present(temp_c).unwrap_or(COLD_COMFORT_C);
    if t >= 10.0 {
        0.0
    } else if t >= 5.0 {
        0.30 * (10.0 - t) / 5.0
    } else if t >= 0.0 {
        0.30 + 0.40 * (5.0 - t) / 5.0
    } else {
        0.70 + 0.30 * (-t).min(5.0) / 5.0
    }
}

pub fn delay_norm(delay_sec: &[Option<f64>]) -> Vec<f64> {
    delay_sec.iter().map(|&d| delay_norm_value(d)).collect()
}

pub fn speed_norm(speed_kph: &[Option<f64>], free_kph: &[Option<f64>]) -> Vec<Option<f64>> {
    speed_kph
        .iter()
        .zip(free_kph)
        .map(|(&s, &f)| speed_norm_value(s, f))
        .collect()
}

pub fn rain_norm(rain_mm: &[Option<f64>]) -> Vec<f64> {
    rain_mm.iter().map(|&r| rain_norm_value(r)).collect()
}

pub fn heat_norm(temp_c: &[Option<f64>]) -> Vec<f64> {
    temp_c.iter().map(|&t| heat_norm_value(t)).collect()
}

pub fn cold_norm(temp_c: &[Option<f64>]) -> Vec<f64> {
    temp_c.iter().map(|&t| cold_norm_value(t)).collect()
}
