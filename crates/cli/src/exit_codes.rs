//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `sbx` exit codes.
//! Exit codes are part of the shell contract; pipelines rely on them.
//!
//! | Code | Meaning                                          |
//! |------|--------------------------------------------------|
//! | 0    | Success (snippet ran, status 0)                  |
//! | 1    | Snippet failed (status 1: compile or runtime)    |
//! | 2    | Usage error (bad args, invalid config)           |
//! | 3    | I/O error (unreadable file, stdout closed)       |
//! | 4    | Request parse error (malformed JSON request)     |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant
//! 2. Document what triggers it
//! 3. Update the table above

use scriptbox_engine::ExecutionResult;

/// Success - snippet ran and reported status 0.
pub const EXIT_SUCCESS: u8 = 0;

/// Snippet failed - the result carries status 1.
pub const EXIT_SNIPPET_FAILED: u8 = 1;

/// Usage error - bad arguments, missing input, invalid settings file.
pub const EXIT_USAGE: u8 = 2;

/// I/O error - input could not be read or output could not be written.
pub const EXIT_IO: u8 = 3;

/// Parse error - the request or data file is not valid JSON.
pub const EXIT_PARSE: u8 = 4;

/// Exit code for a finished run: mirrors the result status.
pub fn result_exit_code(result: &ExecutionResult) -> u8 {
    if result.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_SNIPPET_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [EXIT_SUCCESS, EXIT_SNIPPET_FAILED, EXIT_USAGE, EXIT_IO, EXIT_PARSE];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_result_exit_code() {
        assert_eq!(result_exit_code(&ExecutionResult::empty()), EXIT_SUCCESS);
        let failed: ExecutionResult =
            serde_json::from_str(r#"{"log":["RuntimeError: x"],"status":1}"#).unwrap();
        assert_eq!(result_exit_code(&failed), EXIT_SNIPPET_FAILED);
    }
}
