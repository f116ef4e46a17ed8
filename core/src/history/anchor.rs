/// Scroll anchoring across history insertions
use crate::protocol::MessageId;

/// Keep `anchor_message_id` at `previous_offset_px` from the viewport top
/// after a batch was inserted above it
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAnchorHint {
    pub anchor_message_id: MessageId,
    pub previous_offset_px: f64,
}

/// Topmost visible message as last reported by the rendering layer
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub top_message_id: MessageId,
    pub offset_px: f64,
}

impl Viewport {
    pub fn new(top_message_id: MessageId, offset_px: f64) -> Self {
        Self {
            top_message_id,
            offset_px,
        }
    }
}

/// Implemented by the rendering layer, which owns layout measurement
pub trait ScrollAnchorController: Send + Sync {
    fn pin(&self, anchor_message_id: &MessageId, offset_px: f64);
}

/// For headless front ends with nothing to keep in place
pub struct NoopAnchor;

impl ScrollAnchorController for NoopAnchor {
    fn pin(&self, _anchor_message_id: &MessageId, _offset_px: f64) {}
}
