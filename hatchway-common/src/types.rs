mod secret;

pub use secret::Secret;

/// Channels are positive integers unique within one browser connection;
/// id 0 is the control channel.
pub type ChannelId = u32;
