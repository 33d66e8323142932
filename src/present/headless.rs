//! Presenter with no console: logs button changes and mode indications.

use tracing::{debug, info};

use super::Presenter;
use crate::engine::Mode;
use crate::input::{Buttons, InputSnapshot};

#[derive(Debug, Default)]
pub struct HeadlessPresenter {
    last_buttons: Buttons,
    presented: u64,
}

impl HeadlessPresenter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Presenter for HeadlessPresenter {
    fn present(&mut self, snapshot: &InputSnapshot) {
        self.presented += 1;
        if snapshot.buttons != self.last_buttons {
            let held: Vec<_> = snapshot.buttons.iter().collect();
            debug!("[MITM] Output buttons: {held:?}");
            self.last_buttons = snapshot.buttons;
        }
    }

    fn indicate(&mut self, mode: Mode) {
        info!("[MITM] Mode: {mode:?}");
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn shutdown(&mut self) {
        info!("[MITM] Headless output stopped after {} reports", self.presented);
    }
}
