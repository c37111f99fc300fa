//! Ringtone and ringback cues
//!
//! Two players, built lazily on first use and reused afterwards. At most one
//! cue is active at a time. Playback may be refused (autoplay restrictions),
//! so starting a cue retries with linear backoff in a background task; every
//! stop bumps a generation counter that cancels pending retries and silences
//! a play that completes after the stop.

use crate::config::CueConfig;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Cue playback errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CueError {
    /// Playback was refused by the platform
    #[error("Playback blocked: {0}")]
    Blocked(String),

    /// The asset could not be loaded
    #[error("Failed to load cue asset: {0}")]
    Load(String),
}

/// Which cue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// Incoming call
    Ringtone,
    /// Outgoing call ringing at the peer
    Ringback,
}

/// A playable sound
#[async_trait]
pub trait CuePlayer: Send + Sync {
    /// Start playback; resolves once playback has begun
    async fn play(&self) -> Result<(), CueError>;

    /// Pause, rewind and silence
    fn stop(&self);

    /// Loop playback
    fn set_loop(&self, looping: bool);

    /// Playback volume, 0.0 to 1.0
    fn set_volume(&self, volume: f32);

    /// Whether the cue is audible
    fn is_playing(&self) -> bool;
}

/// Factory for cue players
pub trait CueOutput: Send + Sync {
    /// Build a player for an asset
    fn create_player(&self, asset: &str) -> Arc<dyn CuePlayer>;
}

#[derive(Default)]
struct CueState {
    active: Option<Cue>,
    generation: u64,
    registry: Vec<Arc<dyn CuePlayer>>,
    retries: Vec<JoinHandle<()>>,
}

/// Owner of the ringtone and ringback players
pub struct AudioCueManager {
    output: Arc<dyn CueOutput>,
    config: CueConfig,
    ringtone: OnceCell<Arc<dyn CuePlayer>>,
    ringback: OnceCell<Arc<dyn CuePlayer>>,
    state: Arc<Mutex<CueState>>,
}

impl AudioCueManager {
    /// Create a manager; no player is built until a cue starts
    pub fn new(output: Arc<dyn CueOutput>, config: CueConfig) -> Self {
        Self {
            output,
            config,
            ringtone: OnceCell::new(),
            ringback: OnceCell::new(),
            state: Arc::new(Mutex::new(CueState::default())),
        }
    }

    fn player(&self, cue: Cue) -> Arc<dyn CuePlayer> {
        let (cell, asset) = match cue {
            Cue::Ringtone => (&self.ringtone, &self.config.ringtone_asset),
            Cue::Ringback => (&self.ringback, &self.config.ringback_asset),
        };
        cell.get_or_init(|| {
            tracing::debug!(?cue, %asset, "Creating cue player");
            let player = self.output.create_player(asset);
            self.state.lock().registry.push(player.clone());
            player
        })
        .clone()
    }

    /// Start a cue, silencing the other one
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, cue: Cue) {
        let player = self.player(cue);
        let (attempts, backoff_ms) = match cue {
            Cue::Ringtone => (self.config.ringtone_attempts, self.config.ringtone_backoff_ms),
            Cue::Ringback => (self.config.ringback_attempts, self.config.ringback_backoff_ms),
        };

        let generation = {
            let mut state = self.state.lock();
            Self::silence(&mut state);
            state.active = Some(cue);
            state.generation
        };

        player.set_loop(true);
        player.set_volume(self.config.volume);

        let state = self.state.clone();
        let task = tokio::spawn(async move {
            for attempt in 1..=attempts.max(1) {
                if state.lock().generation != generation {
                    return;
                }
                match player.play().await {
                    Ok(()) => {
                        // a stop landed while play() was pending
                        if state.lock().generation != generation {
                            player.stop();
                            tracing::debug!(?cue, "Late play silenced");
                        } else {
                            tracing::debug!(?cue, attempt, "Cue playing");
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(?cue, attempt, error = %e, "Cue play attempt failed");
                        if attempt < attempts {
                            let delay = Duration::from_millis(backoff_ms * u64::from(attempt));
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            tracing::warn!(?cue, attempts, "Giving up on cue playback");
        });
        self.state.lock().retries.push(task);
    }

    /// Bump the generation, cancel retries and stop every registered player
    fn silence(state: &mut CueState) {
        state.generation += 1;
        state.active = None;
        for task in state.retries.drain(..) {
            task.abort();
        }
        for player in &state.registry {
            player.stop();
        }
    }

    /// Stop both cues
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        let was = state.active;
        Self::silence(&mut state);
        drop(state);
        tracing::debug!(?was, "Cues stopped");
    }

    /// Stop both cues now and again after each configured pass
    ///
    /// The later passes catch a play that resolves after the first stop. A
    /// cue started in the meantime is left alone.
    pub fn stop_all_aggressive(&self) {
        self.stop_all();
        let generation = self.state.lock().generation;
        let passes = self.config.stop_passes_ms.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for offset in passes {
                tokio::time::sleep_until(start + Duration::from_millis(offset)).await;
                let state = state.lock();
                if state.generation != generation {
                    return;
                }
                for player in &state.registry {
                    player.stop();
                }
            }
        });
    }

    /// The cue currently requested, if any
    pub fn active(&self) -> Option<Cue> {
        self.state.lock().active
    }

    /// Whether a cue is audible
    pub fn is_audible(&self, cue: Cue) -> bool {
        let cell = match cue {
            Cue::Ringtone => &self.ringtone,
            Cue::Ringback => &self.ringback,
        };
        cell.get().is_some_and(|p| p.is_playing())
    }

    /// Number of players built so far
    pub fn player_count(&self) -> usize {
        self.state.lock().registry.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackCueOutput;

    fn manager() -> (Arc<LoopbackCueOutput>, AudioCueManager) {
        let output = Arc::new(LoopbackCueOutput::new());
        let manager = AudioCueManager::new(output.clone(), CueConfig::default());
        (output, manager)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_players_are_lazy_and_reused() {
        let (output, manager) = manager();
        assert_eq!(manager.player_count(), 0);
        manager.start(Cue::Ringtone);
        manager.stop_all();
        manager.start(Cue::Ringtone);
        settle().await;
        assert_eq!(manager.player_count(), 1);
        assert_eq!(output.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_cue_audible() {
        let (_output, manager) = manager();
        manager.start(Cue::Ringtone);
        settle().await;
        assert!(manager.is_audible(Cue::Ringtone));

        manager.start(Cue::Ringback);
        settle().await;
        assert!(manager.is_audible(Cue::Ringback));
        assert!(!manager.is_audible(Cue::Ringtone));
        assert_eq!(manager.active(), Some(Cue::Ringback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringtone_retries_with_backoff() {
        let (output, manager) = manager();
        output.block_next_plays(2);
        manager.start(Cue::Ringtone);
        settle().await;
        assert!(!manager.is_audible(Cue::Ringtone));

        // first retry after 500ms, second after a further 1000ms
        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert!(!manager.is_audible(Cue::Ringtone));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle().await;
        assert!(manager.is_audible(Cue::Ringtone));
        assert_eq!(output.play_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let (output, manager) = manager();
        output.block_next_plays(1);
        manager.start(Cue::Ringback);
        settle().await;
        manager.stop_all();

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!manager.is_audible(Cue::Ringback));
        assert_eq!(output.play_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggressive_stop_silences_late_play() {
        let (output, manager) = manager();
        manager.start(Cue::Ringtone);
        settle().await;
        manager.stop_all_aggressive();
        // something outside the manager restarts the sound
        output.force_play_all();
        tokio::time::sleep(Duration::from_millis(20)).await;
        settle().await;
        assert!(!manager.is_audible(Cue::Ringtone));
    }
}
