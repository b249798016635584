use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("no track loaded")]
    NoTrack,
    #[error("rate {0} outside supported range 0.5..2.0")]
    RateOutOfRange(f64),
    #[error("decoder: {0}")]
    Backend(String),
}

/// The audio decoder/output collaborator. All positions are
/// milliseconds into the track. Implementations must be cheap to call;
/// anything slower than a seek belongs off the core loop.
pub trait Player: Send {
    /// Load a track, returning its duration.
    fn load(&mut self, path: &Path) -> Result<i64, PlayerError>;
    fn seek(&mut self, pos_ms: i64) -> Result<(), PlayerError>;
    fn play(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    /// May be a no-op on outputs without native rate control.
    fn set_speed(&mut self, rate: f64) -> Result<(), PlayerError>;
    fn position(&mut self) -> Result<i64, PlayerError>;
    fn duration(&self) -> Option<i64>;
    fn is_playing(&self) -> bool;
}

pub type SharedPlayer = Arc<Mutex<dyn Player>>;

pub fn shared<P: Player + 'static>(player: P) -> SharedPlayer {
    Arc::new(Mutex::new(player))
}
