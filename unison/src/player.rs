use std::path::Path;
use std::time::Instant;

pub use unison_core::player::{shared, Player, PlayerError, SharedPlayer};

/// Silent player that models playback position against the wall clock.
/// Backs headless runs and every test that needs a decoder.
pub struct NullPlayer {
    duration_ms: Option<i64>,
    pos_ms: i64,
    speed: f64,
    playing_since: Option<Instant>,
}

impl NullPlayer {
    pub fn new() -> Self {
        NullPlayer {
            duration_ms: None,
            pos_ms: 0,
            speed: 1.0,
            playing_since: None,
        }
    }

    /// Pre-loaded variant for tests.
    #[cfg(test)]
    pub fn with_duration(duration_ms: i64) -> Self {
        NullPlayer {
            duration_ms: Some(duration_ms),
            ..NullPlayer::new()
        }
    }

    fn settle(&mut self) {
        if let Some(since) = self.playing_since.take() {
            let advanced = since.elapsed().as_millis() as f64 * self.speed;
            self.pos_ms += advanced.round() as i64;
            if let Some(duration) = self.duration_ms {
                self.pos_ms = self.pos_ms.min(duration);
            }
            self.playing_since = Some(Instant::now());
        }
    }
}

impl Default for NullPlayer {
    fn default() -> Self {
        NullPlayer::new()
    }
}

impl Player for NullPlayer {
    fn load(&mut self, path: &Path) -> Result<i64, PlayerError> {
        // a real backend would probe the container here
        log::debug!("null player loading {}", path.display());
        let duration = self.duration_ms.unwrap_or(300_000);
        self.duration_ms = Some(duration);
        self.pos_ms = 0;
        self.playing_since = None;
        Ok(duration)
    }

    fn seek(&mut self, pos_ms: i64) -> Result<(), PlayerError> {
        let duration = self.duration_ms.ok_or(PlayerError::NoTrack)?;
        self.settle();
        self.pos_ms = pos_ms.clamp(0, duration);
        Ok(())
    }

    fn play(&mut self) -> Result<(), PlayerError> {
        if self.duration_ms.is_none() {
            return Err(PlayerError::NoTrack);
        }
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        self.settle();
        self.playing_since = None;
        Ok(())
    }

    fn set_speed(&mut self, rate: f64) -> Result<(), PlayerError> {
        if !(0.5..=2.0).contains(&rate) {
            return Err(PlayerError::RateOutOfRange(rate));
        }
        // account for time already played at the old rate
        self.settle();
        self.speed = rate;
        Ok(())
    }

    fn position(&mut self) -> Result<i64, PlayerError> {
        if self.duration_ms.is_none() {
            return Err(PlayerError::NoTrack);
        }
        self.settle();
        Ok(self.pos_ms)
    }

    fn duration(&self) -> Option<i64> {
        self.duration_ms
    }

    fn is_playing(&self) -> bool {
        self.playing_since.is_some()
    }
}
