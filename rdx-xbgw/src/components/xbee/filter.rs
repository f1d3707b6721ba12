//! Duplicate suppression for I/O samples.

use super::XBeeAddress;
use std::collections::HashMap;
use tracing::debug;

/// Remembers the last published reading of every (device, channel) pair and
/// decides whether a new reading is worth publishing.
///
/// State lives as long as the filter. A reading is only recorded when it is
/// admitted, so slow drift below the analog threshold is never reported.
#[derive(Debug)]
pub struct SampleFilter {
    filter_analog: bool,
    minimum_analog_change: f64,
    filter_digital: bool,
    last_analog: HashMap<(XBeeAddress, u8), f64>,
    last_digital: HashMap<(XBeeAddress, u8), bool>,
}

impl SampleFilter {
    pub fn new(filter_analog: bool, minimum_analog_change: f64, filter_digital: bool) -> Self {
        Self {
            filter_analog,
            minimum_analog_change,
            filter_digital,
            last_analog: HashMap::new(),
            last_digital: HashMap::new(),
        }
    }

    /// Admits an analog reading unless it is within the minimum change of
    /// the last admitted one. A change equal to the minimum is admitted.
    pub fn admit_analog(&mut self, addr: XBeeAddress, channel: u8, value: f64) -> bool {
        if self.filter_analog {
            if let Some(last) = self.last_analog.get(&(addr, channel)) {
                if (value - last).abs() < self.minimum_analog_change {
                    debug!("Dropping {} AD{}", addr, channel);
                    return false;
                }
            }
        }
        self.last_analog.insert((addr, channel), value);
        true
    }

    /// Admits a digital reading unless it equals the last admitted state.
    pub fn admit_digital(&mut self, addr: XBeeAddress, channel: u8, value: bool) -> bool {
        if self.filter_digital && self.last_digital.get(&(addr, channel)) == Some(&value) {
            debug!("Dropping {} DIO{}", addr, channel);
            return false;
        }
        self.last_digital.insert((addr, channel), value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV: XBeeAddress = XBeeAddress::new(1);
    const OTHER: XBeeAddress = XBeeAddress::new(2);

    #[test]
    fn analog_changes_below_the_threshold_are_dropped() {
        let mut filter = SampleFilter::new(true, 1.0, true);
        assert!(filter.admit_analog(DEV, 0, 5.0));
        assert!(!filter.admit_analog(DEV, 0, 5.5));
        assert!(filter.admit_analog(DEV, 0, 6.0));

        let mut filter = SampleFilter::new(true, 1.0, true);
        assert!(filter.admit_analog(DEV, 0, 5.0));
        assert!(filter.admit_analog(DEV, 0, 6.0));
    }

    #[test]
    fn filter_state_is_per_device_and_channel() {
        let mut filter = SampleFilter::new(true, 10.0, true);
        assert!(filter.admit_analog(DEV, 0, 100.0));
        assert!(filter.admit_analog(DEV, 1, 100.0));
        assert!(filter.admit_analog(OTHER, 0, 100.0));
        assert!(!filter.admit_analog(DEV, 0, 105.0));
    }

    #[test]
    fn digital_repeats_are_silent_until_the_state_flips() {
        let mut filter = SampleFilter::new(true, 1.0, true);
        let seen: Vec<bool> = [true, true, true, false, false, true]
            .into_iter()
            .map(|v| filter.admit_digital(DEV, 3, v))
            .collect();
        assert_eq!(seen, vec![true, false, false, true, false, true]);
    }

    #[test]
    fn disabled_filters_admit_everything() {
        let mut filter = SampleFilter::new(false, 1.0, false);
        assert!(filter.admit_analog(DEV, 0, 5.0));
        assert!(filter.admit_analog(DEV, 0, 5.0));
        assert!(filter.admit_digital(DEV, 0, true));
        assert!(filter.admit_digital(DEV, 0, true));
    }
}
