//! Log2 histogram with k-anonymised rendering.

use std::fmt::Write;

use footfall_types::params::INDICATORS_K_REPLACEMENT;

/// Append `value` if it clears the anonymity threshold, `NA` otherwise.
pub fn k_anonymize(value: u64, k: u64, out: &mut String) {
    if value < k {
        out.push_str(INDICATORS_K_REPLACEMENT);
    } else {
        let _ = write!(out, "{value}");
    }
}

fn k_anonymize_percentage(value: u64, k: u64, percentage: f64, out: &mut String) {
    if value < k {
        out.push_str(INDICATORS_K_REPLACEMENT);
        out.push_str(" %");
    } else {
        let _ = write!(out, "{percentage:.1} %");
    }
}

/// A histogram over power-of-two bins.
///
/// `BINS` must be at least 2; the last bin catches everything at or above
/// `lowest_bin_value * 2^(BINS-2)`. The lowest bin value is a power of two
/// given as a `numerator / denominator` pair with one side equal to 1, so
/// fractional bases render as fractions (`1/256`) in the report.
#[derive(Debug, Clone)]
pub struct Log2Histogram<const BINS: usize> {
    lowest_num: u64,
    lowest_den: u64,
    data: [u64; BINS],
}

impl<const BINS: usize> Log2Histogram<BINS> {
    pub fn new(lowest_num: u64, lowest_den: u64) -> Self {
        assert!(BINS >= 2, "a catch-all bin needs at least one regular bin");
        assert!(
            (lowest_num == 1 && lowest_den.is_power_of_two())
                || (lowest_num.is_power_of_two() && lowest_den == 1),
            "lowest bin value must be a power of two"
        );
        Self {
            lowest_num,
            lowest_den,
            data: [0; BINS],
        }
    }

    fn lowest_bin_value(&self) -> f64 {
        self.lowest_num as f64 / self.lowest_den as f64
    }

    /// Count `value` into its bin.
    ///
    /// A non-finite value can only come out of an authenticated state
    /// file, so it is treated as tampering evidence and terminates the
    /// process rather than risking a poisoned report.
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            tracing::error!(
                "histogram input is not finite; the accumulated state appears tampered with, aborting"
            );
            std::process::abort();
        }
        let lowest = self.lowest_bin_value();
        if value < lowest {
            self.data[0] += 1;
            return;
        }
        let highest_normalized = (1u64 << (BINS - 2)) as f64;
        let normalized = (value / lowest).floor().min(highest_normalized) as u64;
        // `normalized >= 1` here, so the bin index is in 1..BINS.
        let bin = 64 - normalized.leading_zeros() as usize;
        self.data[bin] += 1;
    }

    /// Sum over all bins.
    pub fn total(&self) -> u64 {
        self.data.iter().sum()
    }

    /// Raw bin contents, for tests.
    pub fn bins(&self) -> &[u64; BINS] {
        &self.data
    }

    /// Render one line per bin:
    ///
    /// ```text
    /// {prefix} < 1/4: NA (NA %)
    /// {prefix}>= 2: 191 (100.0 %)
    /// ```
    ///
    /// Counts below `k` print as `NA`; the parenthesised figure is the
    /// cumulative percentage.
    pub fn render_into(&self, out: &mut String, prefix: &str, k: u64) {
        let mut num = self.lowest_num;
        let mut den = self.lowest_den;
        let mut previous_num = 0;
        let mut previous_den = 0;

        // Total for the rolling percentage; an empty histogram renders as
        // all-NA, so any non-zero stand-in avoids the zero division.
        let total = self.total().max(1);

        let mut rolling_sum = 0u64;
        for (bin, count) in self.data.iter().enumerate() {
            rolling_sum += count;
            let rolling_percentage = (rolling_sum as f64 / total as f64) * 100.0;

            out.push_str(prefix);
            let (label_num, label_den) = if bin < BINS - 1 {
                out.push_str(" < ");
                (num, den)
            } else {
                out.push_str(">= ");
                (previous_num, previous_den)
            };
            let _ = write!(out, "{label_num}");
            if label_den > 1 {
                let _ = write!(out, "/{label_den}");
            }
            out.push_str(": ");
            k_anonymize(*count, k, out);
            out.push_str(" (");
            k_anonymize_percentage(*count, k, rolling_percentage, out);
            out.push_str(")\n");

            previous_num = num;
            previous_den = den;
            if den > 1 {
                den /= 2;
            } else {
                num *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered<const BINS: usize>(hist: &Log2Histogram<BINS>) -> String {
        let mut out = String::new();
        hist.render_into(&mut out, "\t\t", 1);
        out
    }

    #[test]
    fn empty_histograms_render_all_na() {
        assert_eq!(
            rendered(&Log2Histogram::<5>::new(1, 1)),
            "\t\t < 1: NA (NA %)\n\
             \t\t < 2: NA (NA %)\n\
             \t\t < 4: NA (NA %)\n\
             \t\t < 8: NA (NA %)\n\
             \t\t>= 8: NA (NA %)\n"
        );
        assert_eq!(
            rendered(&Log2Histogram::<5>::new(1, 4)),
            "\t\t < 1/4: NA (NA %)\n\
             \t\t < 1/2: NA (NA %)\n\
             \t\t < 1: NA (NA %)\n\
             \t\t < 2: NA (NA %)\n\
             \t\t>= 2: NA (NA %)\n"
        );
        assert_eq!(
            rendered(&Log2Histogram::<5>::new(8, 1)),
            "\t\t < 8: NA (NA %)\n\
             \t\t < 16: NA (NA %)\n\
             \t\t < 32: NA (NA %)\n\
             \t\t < 64: NA (NA %)\n\
             \t\t>= 64: NA (NA %)\n"
        );
    }

    #[test]
    fn unit_base_binning_and_percentages() {
        let mut hist = Log2Histogram::<5>::new(1, 1);
        for i in 0..35 {
            hist.record(f64::from(i));
        }
        assert_eq!(
            rendered(&hist),
            "\t\t < 1: 1 (2.9 %)\n\
             \t\t < 2: 1 (5.7 %)\n\
             \t\t < 4: 2 (11.4 %)\n\
             \t\t < 8: 4 (22.9 %)\n\
             \t\t>= 8: 27 (100.0 %)\n"
        );
    }

    #[test]
    fn fractional_base_binning() {
        let mut hist = Log2Histogram::<5>::new(1, 4);
        hist.record(0.0);
        hist.record(0.001);
        let mut i = 0.0625;
        while i < 6.0 {
            hist.record(i - 0.01);
            hist.record(i);
            hist.record(i + 0.01);
            i += 0.0625;
        }
        assert_eq!(
            rendered(&hist),
            "\t\t < 1/4: 12 (4.2 %)\n\
             \t\t < 1/2: 12 (8.4 %)\n\
             \t\t < 1: 24 (16.7 %)\n\
             \t\t < 2: 48 (33.4 %)\n\
             \t\t>= 2: 191 (100.0 %)\n"
        );
    }

    #[test]
    fn large_base_binning() {
        let mut hist = Log2Histogram::<5>::new(8, 1);
        hist.record(0.0);
        hist.record(0.001);
        let mut i = 1.0;
        while i < 33.0 {
            hist.record(i - 0.01);
            hist.record(i);
            hist.record(i + 0.01);
            i += 0.5;
        }
        assert_eq!(
            rendered(&hist),
            "\t\t < 8: 45 (23.2 %)\n\
             \t\t < 16: 48 (47.9 %)\n\
             \t\t < 32: 96 (97.4 %)\n\
             \t\t < 64: 5 (100.0 %)\n\
             \t\t>= 64: NA (NA %)\n"
        );
    }

    #[test]
    fn counts_below_k_are_masked() {
        let mut hist = Log2Histogram::<3>::new(1, 1);
        for _ in 0..19 {
            hist.record(0.5);
        }
        for _ in 0..20 {
            hist.record(1.0);
        }
        let mut out = String::new();
        hist.render_into(&mut out, "", 20);
        assert_eq!(
            out,
            " < 1: NA (NA %)\n < 2: 20 (100.0 %)\n>= 2: NA (NA %)\n"
        );
    }
}
