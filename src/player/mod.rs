// 播放桥接核心模块

pub mod diagnostics;
pub mod events;
pub mod manager;
pub mod sinks;
pub mod state_machine;
pub mod tracks;

pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use events::{BridgeEvent, EventQueue};
pub use manager::{MediaBridge, SubscriptionId};
pub use sinks::{AudioChunk, AudioSink, DeliveryOutcome, SampleDelivery, VideoFrame, VideoSink};
pub use state_machine::{BridgeNotification, Outcome, PlaybackSession};
pub use tracks::{Selection, TrackNegotiator};
