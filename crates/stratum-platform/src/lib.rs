// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use std::time::Duration;
use stratum_render::{RenderSize, SizeSource};
use tracing::trace;
use winit::window::Window;

/// Reads the live drawable size of a winit window.
///
/// Resize recovery runs from inside an event callback, so `wait_events`
/// cannot pump the loop; it sleeps for `settle` instead.
pub struct WindowSize<'a> {
    window: &'a Window,
    settle: Duration,
}

impl<'a> WindowSize<'a> {
    pub fn new(window: &'a Window) -> Self {
        WindowSize {
            window,
            settle: Duration::from_millis(4),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl SizeSource for WindowSize<'_> {
    fn current_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize::new(size.width, size.height)
    }

    fn wait_events(&mut self) {
        trace!("waiting {:?} for window size to settle", self.settle);
        std::thread::sleep(self.settle);
    }
}
