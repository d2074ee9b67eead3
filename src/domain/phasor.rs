use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Complex quantity used for apparent power (VA), current (A) and voltage (V).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Phasor {
    pub re: f64,
    pub im: f64,
}

impl Phasor {
    pub const ZERO: Phasor = Phasor { re: 0.0, im: 0.0 };

    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }

    pub fn from_polar(magnitude: f64, angle_rad: f64) -> Self {
        Self {
            re: magnitude * angle_rad.cos(),
            im: magnitude * angle_rad.sin(),
        }
    }

    /// Apparent power from a magnitude and a lagging power factor.
    pub fn from_apparent(magnitude_va: f64, power_factor: f64) -> Self {
        let pf = power_factor.clamp(-1.0, 1.0);
        Self::from_polar(magnitude_va, pf.acos())
    }

    pub fn magnitude(&self) -> f64 {
        self.re.hypot(self.im)
    }

    pub fn angle(&self) -> f64 {
        self.im.atan2(self.re)
    }

    pub fn conj(&self) -> Self {
        Self {
            re: self.re,
            im: -self.im,
        }
    }

    pub fn scale(&self, k: f64) -> Self {
        Self {
            re: self.re * k,
            im: self.im * k,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.re.is_finite() && self.im.is_finite()
    }
}

impl Add for Phasor {
    type Output = Phasor;
    fn add(self, rhs: Phasor) -> Phasor {
        Phasor::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl AddAssign for Phasor {
    fn add_assign(&mut self, rhs: Phasor) {
        self.re += rhs.re;
        self.im += rhs.im;
    }
}

impl Sub for Phasor {
    type Output = Phasor;
    fn sub(self, rhs: Phasor) -> Phasor {
        Phasor::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Neg for Phasor {
    type Output = Phasor;
    fn neg(self) -> Phasor {
        Phasor::new(-self.re, -self.im)
    }
}

impl Mul for Phasor {
    type Output = Phasor;
    fn mul(self, rhs: Phasor) -> Phasor {
        Phasor::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl Div for Phasor {
    type Output = Phasor;
    fn div(self, rhs: Phasor) -> Phasor {
        let den = rhs.re * rhs.re + rhs.im * rhs.im;
        Phasor::new(
            (self.re * rhs.re + self.im * rhs.im) / den,
            (self.im * rhs.re - self.re * rhs.im) / den,
        )
    }
}

impl Sum for Phasor {
    fn sum<I: Iterator<Item = Phasor>>(iter: I) -> Phasor {
        iter.fold(Phasor::ZERO, |acc, p| acc + p)
    }
}

impl fmt::Display for Phasor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im >= 0.0 {
            write!(f, "{:.2}+j{:.2}", self.re, self.im)
        } else {
            write!(f, "{:.2}-j{:.2}", self.re, -self.im)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_and_conjugate() {
        let p = Phasor::new(3.0, 4.0);
        assert_eq!(p.magnitude(), 5.0);
        assert_eq!(p.conj(), Phasor::new(3.0, -4.0));
    }

    #[test]
    fn test_division_inverts_multiplication() {
        let a = Phasor::new(1.5, -2.0);
        let b = Phasor::new(0.3, 0.7);
        let back = (a * b) / b;
        assert!((back.re - a.re).abs() < 1e-12);
        assert!((back.im - a.im).abs() < 1e-12);
    }

    #[test]
    fn test_apparent_power_factor() {
        let s = Phasor::from_apparent(100.0, 0.8);
        assert!((s.re - 80.0).abs() < 1e-9);
        assert!((s.im - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_sum_of_loads() {
        let total: Phasor = vec![Phasor::new(1.0, 1.0), Phasor::new(2.0, -0.5)]
            .into_iter()
            .sum();
        assert_eq!(total, Phasor::new(3.0, 0.5));
    }
}
