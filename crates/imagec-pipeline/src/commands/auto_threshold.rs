//! Automatic global threshold selection on a 256-bin histogram.
//!
//! Every method returns a level `t`: bins `> t` are foreground. The
//! algorithms follow the classic formulations collected in ImageJ's
//! auto-thresholder.

use serde::{Deserialize, Serialize};

/// Number of histogram bins.
pub const BINS: usize = 256;

/// Automatic threshold algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoMethod {
    Huang,
    Intermodes,
    IsoData,
    Li,
    MaxEntropy,
    Mean,
    Minimum,
    Moments,
    Otsu,
    Percentile,
    RenyiEntropy,
    Shanbhag,
    Triangle,
    Yen,
}

impl AutoMethod {
    /// Threshold level for `hist` (length [`BINS`]).
    #[must_use]
    pub fn level(self, hist: &[u64]) -> usize {
        let Some((first, last)) = occupied_range(hist) else {
            return 0;
        };
        if first == last {
            return first;
        }
        let level = match self {
            Self::Huang => huang(hist, first, last),
            Self::Intermodes => intermodes(hist),
            Self::IsoData => iso_data(hist),
            Self::Li => li(hist),
            Self::MaxEntropy => max_entropy(hist),
            Self::Mean => Some(mean(hist)),
            Self::Minimum => minimum(hist),
            Self::Moments => moments(hist),
            Self::Otsu => otsu(hist),
            Self::Percentile => percentile(hist, 0.5),
            Self::RenyiEntropy => renyi_entropy(hist),
            Self::Shanbhag => shanbhag(hist),
            Self::Triangle => triangle(hist, first, last),
            Self::Yen => yen(hist),
        };
        level.unwrap_or_else(|| mean(hist)).min(BINS - 1)
    }
}

/// 256-bin histogram of a 16-bit plane (`bin = v / 257`).
#[must_use]
pub fn histogram8(pixels: &crate::image_plane::Gray16Image) -> Vec<u64> {
    let mut hist = vec![0u64; BINS];
    for p in pixels.pixels() {
        hist[usize::from(p.0[0] / 257)] += 1;
    }
    hist
}

fn occupied_range(hist: &[u64]) -> Option<(usize, usize)> {
    let first = hist.iter().position(|&c| c > 0)?;
    let last = hist.iter().rposition(|&c| c > 0)?;
    Some((first, last))
}

#[allow(clippy::cast_precision_loss)]
fn normalized(hist: &[u64]) -> Vec<f64> {
    let total: u64 = hist.iter().sum();
    hist.iter().map(|&c| c as f64 / total as f64).collect()
}

fn cumulative(p: &[f64]) -> Vec<f64> {
    p.iter()
        .scan(0.0, |acc, v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mean(hist: &[u64]) -> usize {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let sum: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    (sum / total as f64).floor() as usize
}

/// Mean of bins in `range`, or `None` if they are empty.
#[allow(clippy::cast_precision_loss)]
fn range_mean(hist: &[u64], range: std::ops::Range<usize>) -> Option<f64> {
    let (mut n, mut sum) = (0.0, 0.0);
    for i in range {
        n += hist[i] as f64;
        sum += i as f64 * hist[i] as f64;
    }
    (n > 0.0).then(|| sum / n)
}

#[allow(clippy::cast_precision_loss)]
fn otsu(hist: &[u64]) -> Option<usize> {
    let total: f64 = hist.iter().map(|&c| c as f64).sum();
    let sum: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    let (mut w_b, mut sum_b) = (0.0, 0.0);
    let mut best: Option<(f64, usize)> = None;
    for (t, &c) in hist.iter().enumerate() {
        w_b += c as f64;
        if w_b == 0.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0.0 {
            break;
        }
        sum_b += t as f64 * c as f64;
        let m_b = sum_b / w_b;
        let m_f = (sum - sum_b) / w_f;
        let between = w_b * w_f * (m_b - m_f) * (m_b - m_f);
        if best.is_none_or(|(v, _)| between > v) {
            best = Some((between, t));
        }
    }
    best.map(|(_, t)| t)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn iso_data(hist: &[u64]) -> Option<usize> {
    let mut level = mean(hist);
    for _ in 0..BINS {
        let below = range_mean(hist, 0..level + 1)?;
        let above = range_mean(hist, level + 1..BINS)?;
        let next = f64::midpoint(below, above).floor() as usize;
        if next == level {
            return Some(level);
        }
        level = next;
    }
    Some(level)
}

#[allow(clippy::cast_precision_loss)]
fn percentile(hist: &[u64], fraction: f64) -> Option<usize> {
    let cum = cumulative(&normalized(hist));
    cum.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - fraction).abs().total_cmp(&(*b - fraction).abs()))
        .map(|(i, _)| i)
}

#[allow(clippy::cast_precision_loss)]
fn triangle(hist: &[u64], first: usize, last: usize) -> Option<usize> {
    let left = first.saturating_sub(1);
    let right = (last + 1).min(BINS - 1);
    let peak = (0..BINS).max_by_key(|&i| (hist[i], std::cmp::Reverse(i)))?;
    let (a, b) = if peak - left >= right - peak {
        (left, peak)
    } else {
        (peak, right)
    };
    let (ha, hb) = (hist[a] as f64, hist[b] as f64);
    let (dx, dy) = (b as f64 - a as f64, hb - ha);
    (a..=b).max_by(|&i, &j| {
        let d = |k: usize| (dy * k as f64 - dx * hist[k] as f64).abs();
        d(i).total_cmp(&d(j))
    })
}

#[allow(clippy::cast_precision_loss)]
fn moments(hist: &[u64]) -> Option<usize> {
    let p = normalized(hist);
    let (mut m1, mut m2, mut m3) = (0.0, 0.0, 0.0);
    for (i, &pi) in p.iter().enumerate() {
        let x = i as f64;
        m1 += x * pi;
        m2 += x * x * pi;
        m3 += x * x * x * pi;
    }
    let cd = m1.mul_add(-m1, m2);
    if cd.abs() < f64::EPSILON {
        return None;
    }
    let c0 = m1.mul_add(m3, -m2 * m2) / cd;
    let c1 = m1.mul_add(m2, -m3) / cd;
    let disc = c1.mul_add(c1, -4.0 * c0).max(0.0).sqrt();
    let z0 = 0.5 * (-c1 - disc);
    let z1 = 0.5 * (-c1 + disc);
    if (z1 - z0).abs() < f64::EPSILON {
        return None;
    }
    let p0 = (z1 - m1) / (z1 - z0);
    cumulative(&p).iter().position(|&c| c >= p0)
}

fn entropy_terms(p: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let p1 = cumulative(p);
    let p2 = p1.iter().map(|c| 1.0 - c).collect();
    (p1, p2)
}

fn entropy_bounds(p1: &[f64], p2: &[f64]) -> Option<(usize, usize)> {
    let first = p1.iter().position(|&c| c.abs() >= f64::EPSILON)?;
    let last = p2.iter().rposition(|&c| c.abs() >= f64::EPSILON)?;
    (first <= last).then_some((first, last))
}

/// Kapur's maximum-entropy level.
fn max_entropy(hist: &[u64]) -> Option<usize> {
    renyi_level(hist, 1.0)
}

fn renyi_level(hist: &[u64], alpha: f64) -> Option<usize> {
    let p = normalized(hist);
    let (p1, p2) = entropy_terms(&p);
    let (first, last) = entropy_bounds(&p1, &p2)?;
    let entropy = |range: std::ops::RangeInclusive<usize>, total: f64| -> f64 {
        if (alpha - 1.0).abs() < f64::EPSILON {
            range
                .filter(|&i| p[i] > 0.0)
                .map(|i| {
                    let q = p[i] / total;
                    -q * q.ln()
                })
                .sum()
        } else {
            let s: f64 = range.map(|i| (p[i] / total).powf(alpha)).sum();
            if s > 0.0 { s.ln() / (1.0 - alpha) } else { 0.0 }
        }
    };
    (first..=last)
        .map(|t| {
            let back = entropy(0..=t, p1[t]);
            let obj = if t + 1 < BINS { entropy(t + 1..=BINS - 1, p2[t]) } else { 0.0 };
            (t, back + obj)
        })
        .filter(|(_, e)| e.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn renyi_entropy(hist: &[u64]) -> Option<usize> {
    let p = normalized(hist);
    let (p1, p2) = entropy_terms(&p);
    let mut stars = [
        renyi_level(hist, 0.5)?,
        renyi_level(hist, 1.0)?,
        renyi_level(hist, 2.0)?,
    ];
    stars.sort_unstable();
    let [t1, t2, t3] = stars;
    let near = |a: usize, b: usize| a.abs_diff(b) <= 5;
    let (b1, b2, b3) = match (near(t1, t2), near(t2, t3)) {
        (true, true) | (false, false) => (1.0, 2.0, 1.0),
        (true, false) => (0.0, 1.0, 3.0),
        (false, true) => (3.0, 1.0, 0.0),
    };
    let omega = p1[t3] - p1[t1];
    let level = (t1 as f64).mul_add(
        (0.25 * omega).mul_add(b1, p1[t1]),
        (0.25 * t2 as f64 * omega).mul_add(b2, t3 as f64 * (0.25 * omega).mul_add(b3, p2[t3])),
    );
    Some(level.round().clamp(0.0, (BINS - 1) as f64) as usize)
}

fn yen(hist: &[u64]) -> Option<usize> {
    let p = normalized(hist);
    let p1 = cumulative(&p);
    let sq: Vec<f64> = p.iter().map(|v| v * v).collect();
    let p1_sq = cumulative(&sq);
    let mut p2_sq = vec![0.0; BINS];
    for i in (0..BINS - 1).rev() {
        p2_sq[i] = p2_sq[i + 1] + sq[i + 1];
    }
    let log_or_zero = |v: f64| if v > 0.0 { v.ln() } else { 0.0 };
    (0..BINS)
        .map(|t| {
            let crit = -log_or_zero(p1_sq[t] * p2_sq[t]) + 2.0 * log_or_zero(p1[t] * (1.0 - p1[t]));
            (t, crit)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(t, _)| t)
}

fn shanbhag(hist: &[u64]) -> Option<usize> {
    let p = normalized(hist);
    let (p1, p2) = entropy_terms(&p);
    let (first, last) = entropy_bounds(&p1, &p2)?;
    let safe_ln = |v: f64| if v > 0.0 { v.ln() } else { 0.0 };
    (first..=last)
        .filter(|&t| p1[t] > 0.0 && p2[t] > 0.0)
        .map(|t| {
            let term = 0.5 / p1[t];
            let back: f64 = (1..=t).map(|i| -p[i] * safe_ln(1.0 - term * p1[i - 1])).sum::<f64>() * term;
            let term = 0.5 / p2[t];
            let obj: f64 = (t + 1..BINS).map(|i| -p[i] * safe_ln(1.0 - term * p2[i])).sum::<f64>() * term;
            (t, (back - obj).abs())
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn huang(hist: &[u64], first: usize, last: usize) -> Option<usize> {
    let span = last - first;
    let c = span as f64;
    let (mut s, mut w) = (vec![0.0; BINS], vec![0.0; BINS]);
    let (mut acc_s, mut acc_w) = (0.0, 0.0);
    for i in first..=last {
        acc_s += hist[i] as f64;
        acc_w += i as f64 * hist[i] as f64;
        s[i] = acc_s;
        w[i] = acc_w;
    }
    let smu: Vec<f64> = (0..=span)
        .map(|i| {
            let mu = 1.0 / (1.0 + i as f64 / c);
            if mu >= 1.0 {
                0.0
            } else {
                -mu * mu.ln() - (1.0 - mu) * (1.0 - mu).ln()
            }
        })
        .collect();
    (first..last)
        .filter(|&t| s[t] > 0.0 && s[last] - s[t] > 0.0)
        .map(|t| {
            let mu_b = (w[t] / s[t]).round() as usize;
            let mu_o = ((w[last] - w[t]) / (s[last] - s[t])).round() as usize;
            let ent: f64 = (first..=t)
                .map(|i| smu[i.abs_diff(mu_b).min(span)] * hist[i] as f64)
                .chain((t + 1..=last).map(|i| smu[i.abs_diff(mu_o).min(span)] * hist[i] as f64))
                .sum();
            (t, ent)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)
}

#[allow(clippy::cast_precision_loss)]
fn smooth_until_bimodal(hist: &[u64]) -> Option<Vec<f64>> {
    let mut y: Vec<f64> = hist.iter().map(|&c| c as f64).collect();
    for _ in 0..10_000 {
        if modes(&y).len() == 2 {
            return Some(y);
        }
        let prev = y.clone();
        for i in 0..BINS {
            let lo = prev[i.saturating_sub(1)];
            let hi = prev[(i + 1).min(BINS - 1)];
            y[i] = (lo + prev[i] + hi) / 3.0;
        }
    }
    None
}

fn modes(y: &[f64]) -> Vec<usize> {
    (1..y.len() - 1)
        .filter(|&i| y[i - 1] < y[i] && y[i + 1] < y[i])
        .collect()
}

fn intermodes(hist: &[u64]) -> Option<usize> {
    let y = smooth_until_bimodal(hist)?;
    let m = modes(&y);
    Some((m[0] + m[1]) / 2)
}

fn minimum(hist: &[u64]) -> Option<usize> {
    let y = smooth_until_bimodal(hist)?;
    let m = modes(&y);
    (m[0]..=m[1])
        .min_by(|&a, &b| y[a].total_cmp(&y[b]))
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn li(hist: &[u64]) -> Option<usize> {
    const TOLERANCE: f64 = 0.5;
    let mut next = range_mean(hist, 0..BINS)?;
    for _ in 0..1000 {
        let old = next;
        let level = (old + 0.5).floor().max(0.0) as usize;
        let back = range_mean(hist, 0..(level + 1).min(BINS))?;
        let obj = range_mean(hist, (level + 1).min(BINS)..BINS)?;
        if back <= 0.0 || obj <= 0.0 {
            return Some(level);
        }
        let temp = (back - obj) / (back.ln() - obj.ln());
        next = if temp < -f64::EPSILON {
            (temp - 0.5).trunc()
        } else {
            (temp + 0.5).trunc()
        };
        if (next - old).abs() <= TOLERANCE {
            break;
        }
    }
    Some(next.max(0.0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    /// Two Gaussian-ish peaks at 50 and 200.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn bimodal() -> Vec<u64> {
        (0..BINS)
            .map(|i| {
                let a = (-((i as f64 - 50.0) / 10.0).powi(2)).exp() * 1000.0;
                let b = (-((i as f64 - 200.0) / 10.0).powi(2)).exp() * 600.0;
                (a + b).round() as u64
            })
            .collect()
    }

    #[test]
    fn every_method_separates_two_peaks() {
        let hist = bimodal();
        for method in AutoMethod::iter() {
            let level = method.level(&hist);
            assert!(
                (50..200).contains(&level),
                "{method} chose {level}"
            );
        }
    }

    #[test]
    fn single_bin_histogram_returns_that_bin() {
        let mut hist = vec![0; BINS];
        hist[17] = 40;
        for method in AutoMethod::iter() {
            assert_eq!(method.level(&hist), 17, "{method}");
        }
    }

    #[test]
    fn empty_histogram_is_level_zero() {
        assert_eq!(AutoMethod::Otsu.level(&[0; BINS]), 0);
    }

    #[test]
    fn otsu_on_two_spikes_splits_between() {
        let mut hist = vec![0; BINS];
        hist[10] = 100;
        hist[240] = 100;
        let level = AutoMethod::Otsu.level(&hist);
        assert!((10..240).contains(&level));
    }

    #[test]
    fn histogram8_bins_by_257() {
        let img = crate::image_plane::Gray16Image::from_fn(3, 1, |x, _| {
            image::Luma([[0, 257, 65535][x as usize]])
        });
        let hist = histogram8(&img);
        assert_eq!(hist[0], 1);
        assert_eq!(hist[1], 1);
        assert_eq!(hist[255], 1);
    }
}
