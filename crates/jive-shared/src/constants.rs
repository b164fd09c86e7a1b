/// Protocol version advertised by the server
pub const PROTOCOL_VERSION: &str = "/jive/1.0.0";

/// Prefix marking a client-generated placeholder for a conversation that
/// does not exist yet (`temp-chat-<targetUserId>`).
pub const TEMP_CONVERSATION_PREFIX: &str = "temp-chat-";

/// Messages per history page
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Maximum number of search hits returned
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

/// Messages fetched on each side of a "jump to context" target
pub const DEFAULT_SURROUNDING_RANGE: u32 = 10;

/// Avatar assigned to new groups. Never marked for removal.
pub const DEFAULT_GROUP_IMAGE: &str =
    "https://storage.googleapis.com/blog_bucket_12/jive-sgroup-default-portrait-large.png";

/// Avatar assigned to users without a profile image
pub const DEFAULT_AVATAR: &str =
    "https://storage.googleapis.com/blog_bucket_12/default-avatar-profile.png";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Capacity of a connection's outbound event queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
