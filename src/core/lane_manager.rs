//! Registry of named lanes (spec.md §4.4 "the manager"). Owns lane
//! lifecycle and is how `BackpressureStrategy::Redirect` targets get
//! resolved at submit time.

use crate::cancel::CancelToken;
use crate::core::lane::{LaneHandle, LaneStatsSnapshot};
use crate::errors::{EngineError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct LaneManager {
    lanes: RwLock<HashMap<String, Arc<dyn LaneHandle>>>,
}

impl LaneManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a lane and, if it's a `ChannelLane`, wires its redirect
    /// back-reference to this manager so `Redirect` targets resolve.
    pub fn register(self: &Arc<Self>, lane: Arc<dyn LaneHandle>) {
        self.lanes.write().unwrap().insert(lane.name().to_string(), lane);
    }

    /// Same as `register`, but takes the concrete channel lane so its
    /// `set_manager` back-reference can be wired before insertion.
    pub fn register_channel_lane(self: &Arc<Self>, lane: Arc<crate::core::lane::ChannelLane>) {
        lane.set_manager(Arc::downgrade(self));
        self.lanes.write().unwrap().insert(lane.name().to_string(), lane);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LaneHandle>> {
        self.lanes.read().unwrap().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn LaneHandle>> {
        self.lanes.write().unwrap().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.lanes.read().unwrap().keys().cloned().collect()
    }

    pub fn stats(&self) -> Vec<LaneStatsSnapshot> {
        self.lanes.read().unwrap().values().map(|l| l.stats()).collect()
    }

    /// Closes every registered lane, collecting the first error (if any)
    /// but attempting all of them regardless.
    pub async fn close_all(&self, cancel: &CancelToken) -> Result<()> {
        let lanes: Vec<_> = self.lanes.read().unwrap().values().cloned().collect();
        let mut first_err: Option<EngineError> = None;
        for lane in lanes {
            if let Err(e) = lane.close(cancel).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
