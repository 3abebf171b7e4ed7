pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-Id";
pub const HEADER_MCP_PROTOCOL_VERSION: &str = "Mcp-Protocol-Version";
pub const HEADER_X_ACCEL_BUFFERING: &str = "X-Accel-Buffering";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";
/// Methods the streamable HTTP endpoint answers, as advertised in `Allow`.
pub const ALLOWED_METHODS: &str = "GET, POST, DELETE";
