// SPDX-License-Identifier: CEPL-1.0
use crate::RenderSize;

/// Anything that can report the drawable size of a window.
pub trait SizeSource {
    fn current_size(&self) -> RenderSize;
    /// Give the windowing system a chance to settle between reads.
    fn wait_events(&mut self);
}

/// Poll `source` until it reports the same nonzero size twice in a row.
///
/// Gives up after `max_polls` reads and returns `None` (window minimized or
/// still being dragged).
pub fn stable_size<S: SizeSource + ?Sized>(source: &mut S, max_polls: usize) -> Option<RenderSize> {
    let mut previous: Option<RenderSize> = None;
    for _ in 0..max_polls {
        let size = source.current_size();
        if !size.is_empty() && previous == Some(size) {
            return Some(size);
        }
        previous = Some(size);
        source.wait_events();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        sizes: VecDeque<RenderSize>,
        last: RenderSize,
        waits: usize,
    }

    impl Scripted {
        fn new(sizes: &[(u32, u32)]) -> Self {
            Scripted {
                sizes: sizes.iter().map(|&(w, h)| RenderSize::new(w, h)).collect(),
                last: RenderSize::default(),
                waits: 0,
            }
        }
    }

    impl SizeSource for Scripted {
        fn current_size(&self) -> RenderSize {
            self.sizes.front().copied().unwrap_or(self.last)
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            if let Some(s) = self.sizes.pop_front() {
                self.last = s;
            }
        }
    }

    #[test]
    fn waits_out_zero_and_changing_sizes() {
        let mut src = Scripted::new(&[(0, 0), (0, 0), (640, 480), (800, 600), (800, 600)]);
        assert_eq!(stable_size(&mut src, 16), Some(RenderSize::new(800, 600)));
        assert_eq!(src.waits, 4);
    }

    #[test]
    fn minimized_window_gives_up() {
        let mut src = Scripted::new(&[(0, 0)]);
        assert_eq!(stable_size(&mut src, 8), None);
    }

    #[test]
    fn already_stable_needs_one_wait() {
        let mut src = Scripted::new(&[(1024, 768)]);
        assert_eq!(stable_size(&mut src, 4), Some(RenderSize::new(1024, 768)));
        assert_eq!(src.waits, 1);
    }
}
