use serde::{Deserialize, Serialize};

/// Session parameters handed over by the device/property layer as plain
/// key/value configuration. The session only consumes these values; it
/// never parses their textual encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XportArgs {
    /// This session's endpoint id; inbound traffic is filtered on it.
    pub epid: u16,
    /// Frames reserved on the send link.
    pub num_send_frames: usize,
    /// Frames reserved on the recv link for control traffic.
    pub num_ctrl_frames: usize,
    /// Frames reserved on the recv link for management traffic.
    pub num_mgmt_frames: usize,
}

impl Default for XportArgs {
    fn default() -> Self {
        Self {
            epid: 0,
            num_send_frames: 2,
            num_ctrl_frames: 2,
            num_mgmt_frames: 1,
        }
    }
}

impl XportArgs {
    pub fn new(epid: u16) -> Self {
        Self {
            epid,
            ..Self::default()
        }
    }

    pub fn with_num_send_frames(mut self, num_send_frames: usize) -> Self {
        self.num_send_frames = num_send_frames;
        self
    }

    pub fn with_num_ctrl_frames(mut self, num_ctrl_frames: usize) -> Self {
        self.num_ctrl_frames = num_ctrl_frames;
        self
    }

    pub fn with_num_mgmt_frames(mut self, num_mgmt_frames: usize) -> Self {
        self.num_mgmt_frames = num_mgmt_frames;
        self
    }
}
