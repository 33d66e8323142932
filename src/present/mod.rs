//! Console side: where the multiplexed snapshot goes.
//!
//! The backend is picked at startup. [`bluetooth::BluetoothPresenter`]
//! emulates a Pro Controller over BlueZ; [`headless::HeadlessPresenter`]
//! only logs, for bench runs without a console. If Bluetooth cannot be set
//! up the bridge keeps running headless.

pub mod bluetooth;
pub mod headless;
pub mod sdp;
pub mod switch;

use std::future::Future;

use tracing::warn;

use crate::config::Output;
use crate::engine::Mode;
use crate::input::InputSnapshot;
use crate::usb::protocol::{LED_MACRO_MODE, LED_NORMAL, LED_PLAYBACK, LED_RECORDING};

pub use self::bluetooth::BluetoothPresenter;
pub use self::headless::HeadlessPresenter;

/// Output capability of the hardware loop.
///
/// `present` and `indicate` are called from the tick and must not block.
pub trait Presenter {
    /// Replace what the console sees.
    fn present(&mut self, snapshot: &InputSnapshot);

    /// Show the engine mode to the player.
    fn indicate(&mut self, mode: Mode);

    fn is_connected(&self) -> bool;

    /// Release the console link. Called once, after the last `present`.
    fn shutdown(&mut self) -> impl Future<Output = ()>;
}

/// The backend in use.
pub enum Console {
    Bluetooth(BluetoothPresenter),
    Headless(HeadlessPresenter),
}

impl Console {
    pub async fn open(output: Output) -> Self {
        match output {
            Output::Bluetooth => Self::or_headless(BluetoothPresenter::start().await),
            Output::Headless => Console::Headless(HeadlessPresenter::new()),
        }
    }

    fn or_headless(started: anyhow::Result<BluetoothPresenter>) -> Self {
        match started {
            Ok(bt) => Console::Bluetooth(bt),
            Err(e) => {
                warn!("[BT] Bluetooth setup failed: {e:#}. Continuing headless");
                Console::Headless(HeadlessPresenter::new())
            }
        }
    }
}

impl Presenter for Console {
    fn present(&mut self, snapshot: &InputSnapshot) {
        match self {
            Console::Bluetooth(p) => p.present(snapshot),
            Console::Headless(p) => p.present(snapshot),
        }
    }

    fn indicate(&mut self, mode: Mode) {
        match self {
            Console::Bluetooth(p) => p.indicate(mode),
            Console::Headless(p) => p.indicate(mode),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Console::Bluetooth(p) => p.is_connected(),
            Console::Headless(p) => p.is_connected(),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Console::Bluetooth(p) => p.shutdown().await,
            Console::Headless(p) => p.shutdown().await,
        }
    }
}

/// Player-LED pattern for each mode.
pub fn led_pattern(mode: Mode) -> &'static [u8; 16] {
    match mode {
        Mode::Idle => &LED_NORMAL,
        Mode::MacroArmed => &LED_MACRO_MODE,
        Mode::Recording => &LED_RECORDING,
        Mode::Playing => &LED_PLAYBACK,
    }
}
