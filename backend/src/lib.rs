// Library module for testable functions

pub mod collaborators;
pub mod config;
pub mod valuation;

/// Calculate price per square foot
/// Formula: price / sqft
pub fn price_per_sqft(price: f64, sqft: u32) -> Option<f64> {
    if sqft == 0 || !price.is_finite() || price <= 0.0 {
        return None;
    }
    Some(price / sqft as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_per_sqft_calculation() {
        // Test normal case
        let ppsf = price_per_sqft(430_000.0, 2150);
        assert!(ppsf.is_some());
        let ppsf = ppsf.unwrap();
        assert!((ppsf - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_price_per_sqft_fractional() {
        let ppsf = price_per_sqft(450_000.0, 2200);
        assert!(ppsf.is_some());
        let ppsf = ppsf.unwrap();
        assert!((ppsf - 204.55).abs() < 0.01);
    }

    #[test]
    fn test_price_per_sqft_zero_sqft() {
        // Zero area is never divided by
        assert!(price_per_sqft(450_000.0, 0).is_none());
    }

    #[test]
    fn test_price_per_sqft_non_positive_price() {
        assert!(price_per_sqft(0.0, 2000).is_none());
        assert!(price_per_sqft(-100_000.0, 2000).is_none());
        assert!(price_per_sqft(f64::NAN, 2000).is_none());
    }
}
