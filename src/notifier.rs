// =============================================================================
// Notifier — console + optional sound alerts on position transitions
// =============================================================================
//
// Three events: opened, closed-with-profit, closed-with-loss. Delivery is
// best-effort and fire-and-forget: sound playback runs on a detached blocking
// task and is never awaited, so accounting can never stall on it.
//
// Env flags:
//   TRADING_SOUNDS_ENABLED=false  disables sound (console lines stay)
//   TRADING_SOUNDS_TTS=true       speaks the event instead of a chime
// =============================================================================

use std::process::{Command, Stdio};

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoundKind {
    Positive,
    Negative,
}

pub struct Notifier {
    sounds_enabled: bool,
    use_tts: bool,
}

impl Notifier {
    /// Build from the `TRADING_SOUNDS_*` environment flags.
    pub fn from_env() -> Self {
        let sounds_enabled = std::env::var("TRADING_SOUNDS_ENABLED")
            .map(|v| v.to_ascii_lowercase() != "false")
            .unwrap_or(true);
        let use_tts = std::env::var("TRADING_SOUNDS_TTS")
            .map(|v| v.to_ascii_lowercase() == "true")
            .unwrap_or(false);

        debug!(sounds_enabled, use_tts, "notifier initialised");
        Self {
            sounds_enabled,
            use_tts,
        }
    }

    /// Console-only notifier for tests and headless runs.
    pub fn silent() -> Self {
        Self {
            sounds_enabled: false,
            use_tts: false,
        }
    }

    pub fn position_opened(&self, symbol: &str, side: &str) {
        info!(symbol, side, "position opened");
        self.dispatch(SoundKind::Positive, format!("Opened {side} on {symbol}"));
    }

    pub fn position_closed_profit(&self, symbol: &str, pnl: f64) {
        info!(symbol, pnl = format!("{pnl:+.2}"), "position closed with profit");
        self.dispatch(
            SoundKind::Positive,
            format!("Closed {symbol} with a profit of {pnl:.2} dollars"),
        );
    }

    pub fn position_closed_loss(&self, symbol: &str, pnl: f64) {
        info!(symbol, pnl = format!("{pnl:+.2}"), "position closed with loss");
        self.dispatch(
            SoundKind::Negative,
            format!("Closed {symbol} with a loss of {:.2} dollars", pnl.abs()),
        );
    }

    fn dispatch(&self, kind: SoundKind, message: String) {
        if !self.sounds_enabled {
            return;
        }
        let use_tts = self.use_tts;

        // Detached: playback failures only ever produce a debug line.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = play(kind, use_tts, &message) {
                debug!(error = %e, "sound playback failed");
            }
        });
    }
}

fn play(kind: SoundKind, use_tts: bool, message: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        if use_tts {
            return run_silent("say", &[message]);
        }
        let sound = match kind {
            SoundKind::Positive => "/System/Library/Sounds/Glass.aiff",
            SoundKind::Negative => "/System/Library/Sounds/Basso.aiff",
        };
        return run_silent("afplay", &[sound]);
    }

    #[cfg(not(target_os = "macos"))]
    {
        if use_tts {
            return run_silent("espeak", &[message]);
        }
        let _ = (kind, message);
        // Terminal bell as the portable fallback chime.
        run_silent("printf", &["\x07"])
    }
}

fn run_silent(program: &str, args: &[&str]) -> std::io::Result<()> {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sounds_enabled", &self.sounds_enabled)
            .field("use_tts", &self.use_tts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_notifier_never_dispatches() {
        let n = Notifier::silent();
        assert!(!n.sounds_enabled);
        // No runtime needed: dispatch returns before spawning.
        n.position_opened("BTC-USD", "long");
        n.position_closed_profit("BTC-USD", 12.5);
        n.position_closed_loss("BTC-USD", -3.0);
    }
}
