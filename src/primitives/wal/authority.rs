use crate::types::{Result, WalError};

/// Callbacks from the log writer to whatever owns checkpointing and process
/// lifecycle. Every method has a no-op default.
pub trait CheckpointAuthority: Send + Sync {
    /// Occupancy passed the checkpoint threshold after a flush.
    fn suggest_checkpoint(&self, _occupancy: f32) {}

    /// Occupancy passed the high-water threshold; new work should back off.
    fn occupancy_high(&self, _occupancy: f32) {}

    /// A helper thread failed and the log can no longer make progress.
    fn request_shutdown(&self, _cause: &WalError) {}

    /// Blocks until a checkpoint has completed. Called by the resize loop
    /// while it waits for live data to shrink.
    fn wait_for_checkpoint(&self) -> Result<()> {
        Ok(())
    }
}

/// Authority that ignores every callback.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuthority;

impl CheckpointAuthority for NoopAuthority {}
