use std::sync::RwLock;

use crate::store::ImageId;

/// Process-wide slot holding the id of the most recently described image.
///
/// This is deliberately a single shared value, not per-caller state: every
/// follow-up question is answered against whatever photo arrived last,
/// whoever sent it. Writes overwrite unconditionally (last writer wins under
/// concurrency), reads see either the old or the new value, never a torn one,
/// and nothing survives a restart.
#[derive(Default)]
pub struct LatestImage {
    slot: RwLock<Option<ImageId>>,
}

impl LatestImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: ImageId) {
        *self.slot.write().unwrap() = Some(id);
    }

    /// `None` until the first successful upload in this process.
    pub fn get(&self) -> Option<ImageId> {
        self.slot.read().unwrap().clone()
    }
}
