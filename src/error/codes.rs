/// Error code registry for toolbridge
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Worker transport errors
/// - 3000-3999: Tool errors
/// - 4000-4999: Text generation errors
/// - 5000-5999: Protein lookup errors
/// - 7000-7999: Validation errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1002;
    pub const CONFIG_INVALID_VALUE: u16 = 1003;

    // Worker transport errors (2000-2999)
    pub const WORKER_GENERIC: u16 = 2000;
    pub const WORKER_SPAWN_FAILED: u16 = 2001;
    pub const WORKER_START_FAILED: u16 = 2002;
    pub const WORKER_UNAVAILABLE: u16 = 2003;
    pub const WORKER_TRANSPORT: u16 = 2004;
    pub const WORKER_TERMINATED: u16 = 2005;
    pub const WORKER_STOP_TIMEOUT: u16 = 2007;
    pub const WORKER_INVALID_CONFIG: u16 = 2008;
    pub const WORKER_PROTOCOL: u16 = 2009;

    // Tool errors (3000-3999)
    pub const TOOL_GENERIC: u16 = 3000;
    pub const TOOL_FAILED: u16 = 3001;
    pub const TOOL_TIMEOUT: u16 = 3002;
    pub const TOOL_SERVER_IO: u16 = 3003;

    // Text generation errors (4000-4999)
    pub const LLM_GENERIC: u16 = 4000;
    pub const LLM_HTTP: u16 = 4001;
    pub const LLM_STATUS: u16 = 4002;
    pub const LLM_RATE_LIMITED: u16 = 4003;
    pub const LLM_MISSING_API_KEY: u16 = 4004;
    pub const LLM_MISSING_MODEL: u16 = 4005;
    pub const LLM_EMPTY_RESPONSE: u16 = 4006;
    pub const LLM_MALFORMED_JSON: u16 = 4007;

    // Protein lookup errors (5000-5999)
    pub const LOOKUP_GENERIC: u16 = 5000;
    pub const LOOKUP_HTTP: u16 = 5001;
    pub const LOOKUP_STATUS: u16 = 5002;
    pub const LOOKUP_DECODE: u16 = 5003;

    // Validation errors (7000-7999)
    pub const VALIDATION_GENERIC: u16 = 7000;
    pub const VALIDATION_UNKNOWN_TOOL: u16 = 7001;
    pub const VALIDATION_MISSING_PARAMS: u16 = 7002;
    pub const VALIDATION_UNKNOWN_PARAM: u16 = 7003;
    pub const VALIDATION_INVALID_TYPE: u16 = 7004;
    pub const VALIDATION_INVALID_INPUT: u16 = 7005;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9004;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        // Configuration errors
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1002 => "Failed to parse configuration",
        1003 => "Invalid value in configuration",

        // Worker transport errors
        2000 => "Generic worker error",
        2001 => "Failed to spawn the worker process",
        2002 => "Worker exited during startup",
        2003 => "Worker service is unavailable",
        2004 => "Failed to write to the worker",
        2005 => "Worker terminated while a call was pending",
        2007 => "Worker did not stop in time",
        2008 => "Invalid worker configuration",
        2009 => "Worker protocol error",

        // Tool errors
        3000 => "Generic tool error",
        3001 => "Tool reported an error",
        3002 => "Tool call timed out",
        3003 => "Tool server I/O error",

        // Text generation errors
        4000 => "Generic text generation error",
        4001 => "Failed to reach the text generation provider",
        4002 => "Text generation provider returned an error status",
        4003 => "Text generation rate limit exceeded",
        4004 => "No API key configured for the provider",
        4005 => "No model configured for the provider",
        4006 => "Provider returned an empty response",
        4007 => "Model output was not valid JSON",

        // Protein lookup errors
        5000 => "Generic lookup error",
        5001 => "Failed to reach the protein database",
        5002 => "Protein database returned an error status",
        5003 => "Failed to decode the protein database response",

        // Validation errors
        7000 => "Generic validation error",
        7001 => "Unknown tool",
        7002 => "Required parameters are missing",
        7003 => "Unknown parameter",
        7004 => "Parameter has the wrong type",
        7005 => "Invalid input",

        // Other errors
        9000 => "Generic error",
        9004 => "Internal error",

        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_described() {
        for code in [
            ErrorCode::CONFIG_PARSE_ERROR,
            ErrorCode::WORKER_UNAVAILABLE,
            ErrorCode::TOOL_TIMEOUT,
            ErrorCode::LLM_MALFORMED_JSON,
            ErrorCode::LOOKUP_STATUS,
            ErrorCode::VALIDATION_MISSING_PARAMS,
        ] {
            assert_ne!(describe_error_code(code), "Unknown error code");
        }
        assert_eq!(describe_error_code(8123), "Unknown error code");
    }
}
