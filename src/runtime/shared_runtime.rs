//! Leaf helpers called from generated code.
//!
//! These follow the Java semantics the templates rely on. On x86-32 hosts
//! their addresses are installed as the runtime entries; elsewhere they
//! serve as reference implementations for tests.

/// double -> int: NaN maps to 0, out-of-range values saturate.
pub extern "C" fn d2i(x: f64) -> i32 {
    x as i32
}

/// double -> long
pub extern "C" fn d2l(x: f64) -> i64 {
    x as i64
}

/// float -> int
pub extern "C" fn f2i(x: f32) -> i32 {
    x as i32
}

/// float -> long
pub extern "C" fn f2l(x: f32) -> i64 {
    x as i64
}

/// `x / y`; the divisor is pushed first. The zero check happens in the template.
pub extern "C" fn ldiv(y: i64, x: i64) -> i64 {
    x.wrapping_div(y)
}

/// `x % y`; the divisor is pushed first.
pub extern "C" fn lrem(y: i64, x: i64) -> i64 {
    x.wrapping_rem(y)
}

pub extern "C" fn lmul(y: i64, x: i64) -> i64 {
    x.wrapping_mul(y)
}

/// C `fmod` semantics, which is what `frem` specifies.
pub extern "C" fn frem(x: f32, y: f32) -> f32 {
    x % y
}

pub extern "C" fn drem(x: f64, y: f64) -> f64 {
    x % y
}

pub extern "C" fn dsin(x: f64) -> f64 {
    x.sin()
}

pub extern "C" fn dcos(x: f64) -> f64 {
    x.cos()
}

pub extern "C" fn dtan(x: f64) -> f64 {
    x.tan()
}

pub extern "C" fn dexp(x: f64) -> f64 {
    x.exp()
}

pub extern "C" fn dpow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

pub extern "C" fn dlog(x: f64) -> f64 {
    x.ln()
}

pub extern "C" fn dlog10(x: f64) -> f64 {
    x.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_d2i_special_values() {
        assert_eq!(d2i(f64::NAN), 0);
        assert_eq!(d2i(f64::INFINITY), i32::MAX);
        assert_eq!(d2i(f64::NEG_INFINITY), i32::MIN);
        assert_eq!(d2i(-2.9), -2);
        assert_eq!(d2l(1e300), i64::MAX);
        assert_eq!(f2i(f32::NAN), 0);
    }

    #[test]
    fn test_long_division_edge_cases() {
        assert_eq!(ldiv(-1, i64::MIN), i64::MIN);
        assert_eq!(lrem(-1, i64::MIN), 0);
        assert_eq!(ldiv(3, -7), -2);
        assert_eq!(lrem(3, -7), -1);
    }

    #[test]
    fn test_frem_sign_follows_dividend() {
        assert_eq!(drem(-5.5, 2.0), -1.5);
        assert!(frem(1.0, 0.0).is_nan());
    }

    proptest! {
        #[test]
        fn prop_d2i_truncates_finite_in_range(x in -2.0e9f64..2.0e9f64) {
            prop_assert_eq!(d2i(x) as f64, x.trunc());
        }

        #[test]
        fn prop_d2i_saturates(x in any::<f64>()) {
            let r = d2i(x);
            if x.is_nan() {
                prop_assert_eq!(r, 0);
            } else if x >= i32::MAX as f64 {
                prop_assert_eq!(r, i32::MAX);
            } else if x <= i32::MIN as f64 {
                prop_assert_eq!(r, i32::MIN);
            }
        }
    }
}
