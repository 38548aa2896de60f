/// Multicast group Things announce themselves on
pub const DISCOVERY_GROUP: &str = "232.1.1.1";

/// UDP port of the announcement group
pub const DISCOVERY_PORT: u16 = 1235;

/// TCP control port every Thing accepts service calls on
pub const CONTROL_PORT: u16 = 6668;

/// Per-call connect/read timeout in milliseconds
pub const CALL_TIMEOUT_MS: u64 = 2000;

/// Discriminator field present in every announcement and call
pub const FIELD_TWEET_TYPE: &str = "Tweet Type";

/// Announcement kinds
pub const TWEET_IDENTITY_THING: &str = "Identity_Thing";
pub const TWEET_IDENTITY_ENTITY: &str = "Identity_Entity";
pub const TWEET_SERVICE: &str = "Service";
pub const TWEET_RELATIONSHIP: &str = "Relationship";

/// Call request discriminator
pub const TWEET_SERVICE_CALL: &str = "Service Call";

/// Response status value meaning the call succeeded (compared case-insensitively)
pub const STATUS_SUCCESSFUL: &str = "successful";

/// API path prefix
pub const API_PREFIX: &str = "/v1";
