//! Warm-up windows for metric adaptation.
//!
//! Warm-up is split into an initial fast phase (step size only), a
//! sequence of slow windows that each end with a new metric estimate,
//! and a final fast phase. Draw indices are zero based.

use crate::NutsError;

/// Window settings of the default doubling schedule
#[derive(Debug, Clone, Copy)]
pub struct WindowOptions {
    pub init_buffer: u64,
    pub term_buffer: u64,
    pub base_window: u64,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptationSchedule {
    num_tune: u64,
    init_buffer: u64,
    window_ends: Vec<u64>,
}

impl AdaptationSchedule {
    /// Doubling windows that fill the space between the buffers.
    ///
    /// If the buffers do not fit into `num_tune` draws they are replaced by
    /// 15% and 10% of the warm-up. If the first window would then be shorter
    /// than `min_window`, there are no slow windows at all.
    pub fn new(num_tune: u64, options: WindowOptions, min_window: u64) -> Self {
        let no_windows = AdaptationSchedule {
            num_tune,
            init_buffer: num_tune,
            window_ends: vec![],
        };
        if num_tune < 20 {
            return no_windows;
        }

        let WindowOptions {
            mut init_buffer,
            mut term_buffer,
            mut base_window,
        } = options;
        if init_buffer + base_window + term_buffer > num_tune {
            init_buffer = (0.15 * num_tune as f64) as u64;
            term_buffer = (0.1 * num_tune as f64) as u64;
            base_window = num_tune - (init_buffer + term_buffer);
        }
        if base_window < min_window.max(1) {
            return no_windows;
        }

        let last_end = num_tune - term_buffer - 1;
        let mut end = init_buffer + base_window - 1;
        let mut window_ends = vec![end];
        let mut size = base_window;
        while end < last_end {
            size *= 2;
            end += size;
            // Stretch the window if the next one (twice as long) would not fit.
            if end + 2 * size >= num_tune - term_buffer {
                end = last_end;
            }
            window_ends.push(end);
        }

        AdaptationSchedule {
            num_tune,
            init_buffer,
            window_ends,
        }
    }

    /// Use the given window ends, the first window starts at `init_buffer`.
    pub fn from_explicit(
        num_tune: u64,
        init_buffer: u64,
        window_ends: Vec<u64>,
        min_window: u64,
    ) -> Result<Self, NutsError> {
        let mut start = init_buffer;
        for &end in window_ends.iter() {
            if end < start {
                return Err(NutsError::InvalidSettings(format!(
                    "Adaptation window ends must be increasing and after the initial buffer, got {:?}",
                    window_ends
                )));
            }
            if end - start + 1 < min_window {
                return Err(NutsError::InvalidSettings(format!(
                    "Adaptation window [{}, {}] is shorter than {} draws",
                    start, end, min_window
                )));
            }
            if end >= num_tune {
                return Err(NutsError::InvalidSettings(format!(
                    "Adaptation window end {} is not inside the warm-up of {} draws",
                    end, num_tune
                )));
            }
            start = end + 1;
        }
        Ok(AdaptationSchedule {
            num_tune,
            init_buffer,
            window_ends,
        })
    }

    pub fn num_tune(&self) -> u64 {
        self.num_tune
    }

    pub fn window_ends(&self) -> &[u64] {
        &self.window_ends
    }

    pub fn in_slow_phase(&self, draw: u64) -> bool {
        match self.window_ends.last() {
            Some(&last) => (self.init_buffer <= draw) & (draw <= last),
            None => false,
        }
    }

    /// The index of the window that contains `draw`.
    pub fn window_index(&self, draw: u64) -> Option<usize> {
        if !self.in_slow_phase(draw) {
            return None;
        }
        self.window_ends.iter().position(|&end| draw <= end)
    }

    pub fn window_start(&self, window: usize) -> u64 {
        if window == 0 {
            self.init_buffer
        } else {
            self.window_ends[window - 1] + 1
        }
    }

    pub fn window_len(&self, window: usize) -> u64 {
        self.window_ends[window] - self.window_start(window) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schedule(num_tune: u64) -> AdaptationSchedule {
        AdaptationSchedule::new(num_tune, WindowOptions::default(), 20)
    }

    #[test]
    fn default_windows() {
        let schedule = schedule(1000);
        assert_eq!(schedule.window_ends(), &[99, 149, 249, 449, 949]);
        assert_eq!(schedule.window_len(0), 25);
        assert_eq!(schedule.window_len(1), 50);
        assert_eq!(schedule.window_len(4), 500);
        assert!(!schedule.in_slow_phase(74));
        assert!(schedule.in_slow_phase(75));
        assert!(schedule.in_slow_phase(949));
        assert!(!schedule.in_slow_phase(950));
        assert_eq!(schedule.window_index(100), Some(1));
        assert_eq!(schedule.window_index(99), Some(0));
        assert_eq!(schedule.window_index(20), None);
    }

    #[test]
    fn exact_fit() {
        assert_eq!(schedule(150).window_ends(), &[99]);
    }

    #[test]
    fn short_warmup_uses_fractions() {
        let schedule = schedule(100);
        assert_eq!(schedule.window_ends(), &[89]);
        assert_eq!(schedule.window_start(0), 15);
        assert!(!schedule.in_slow_phase(14));
        assert!(schedule.in_slow_phase(15));
        assert!(!schedule.in_slow_phase(90));

        assert_eq!(self::schedule(30).window_ends(), &[26]);
    }

    #[test]
    fn tiny_warmup_has_no_windows() {
        for num_tune in [1, 10, 19, 20] {
            let schedule = schedule(num_tune);
            assert!(schedule.window_ends().is_empty());
            assert!((0..num_tune).all(|draw| !schedule.in_slow_phase(draw)));
        }
    }

    #[test]
    fn only_later_windows_are_stretched() {
        assert_eq!(schedule(170).window_ends(), &[99, 119]);
        assert_eq!(schedule(200).window_ends(), &[99, 149]);
        assert_eq!(schedule(300).window_ends(), &[99, 149, 249]);
        // The first window keeps its base length even if only one draw remains
        assert_eq!(schedule(151).window_ends(), &[99, 100]);
    }

    #[test]
    fn windows_cover_slow_phase() {
        for num_tune in [25, 99, 300, 1000, 5000] {
            let schedule = schedule(num_tune);
            let ends = schedule.window_ends();
            assert!(ends.windows(2).all(|w| w[0] < w[1]));
            for window in 0..ends.len() {
                assert!(schedule.window_len(window) >= 20);
            }
        }
    }

    #[test]
    fn explicit_windows() {
        let schedule = AdaptationSchedule::from_explicit(200, 50, vec![79, 139], 20).unwrap();
        assert_eq!(schedule.window_len(0), 30);
        assert_eq!(schedule.window_len(1), 60);
        assert!(!schedule.in_slow_phase(140));

        assert!(AdaptationSchedule::from_explicit(200, 50, vec![79, 60], 20).is_err());
        assert!(AdaptationSchedule::from_explicit(200, 50, vec![59], 20).is_err());
        assert!(AdaptationSchedule::from_explicit(200, 50, vec![79, 200], 20).is_err());
    }
}
