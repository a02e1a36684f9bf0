use tracing::warn;

/* ============================= LIMITS ============================= */

/// Stream cap applied to stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "\n[Output truncated - size limit exceeded]";

/// Extensions never returned to clients, regardless of size.
const DANGEROUS_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".sh", ".ps1", ".scr", ".com"];

/// Workspace path inside the sandbox that produced files are relative to.
const WORKSPACE_PREFIX: &str = "/mnt/data/";

/* ============================= SANITISATION ============================= */

/// Truncate to the output cap and strip control bytes, preserving
/// `\n`, `\r`, and `\t`.
pub fn sanitize_output(output: &str) -> String {
    let mut out = if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        // Back off to a char boundary before slicing
        while cut > 0 && !output.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{}", &output[..cut], TRUNCATION_MARKER)
    } else {
        output.to_string()
    };

    out.retain(|c| {
        !matches!(c, '\x00'..='\x08' | '\x0B' | '\x0C' | '\x0E'..='\x1F' | '\x7F')
    });

    out
}

/* ============================= FILE VALIDATION ============================= */

/// A file the sandbox reported as produced by the execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ProducedFile {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

/// Decide whether a produced file may be returned to the client.
///
/// Rejects oversized files, traversal attempts, and executable
/// extensions.
pub fn validate_produced_file(filename: &str, size: u64, max_file_size_mb: u64) -> bool {
    if size > max_file_size_mb * 1024 * 1024 {
        warn!(filename = %filename, size, "produced_file_too_large");
        return false;
    }

    let relative = filename.strip_prefix(WORKSPACE_PREFIX).unwrap_or(filename);
    if relative.contains("..") || relative.starts_with('/') {
        warn!(filename = %filename, "produced_file_suspicious_path");
        return false;
    }

    let lower = relative.to_lowercase();
    if DANGEROUS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        warn!(filename = %filename, "produced_file_dangerous_extension");
        return false;
    }

    true
}

/// MIME type from the file extension; octet-stream when unknown.
pub fn guess_mime_type(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── sanitize_output ──

    #[test]
    fn test_short_output_unchanged() {
        assert_eq!(sanitize_output("hello\n"), "hello\n");
    }

    #[test]
    fn test_newlines_tabs_preserved() {
        assert_eq!(sanitize_output("a\n\tb\r\nc"), "a\n\tb\r\nc");
    }

    #[test]
    fn test_control_bytes_stripped() {
        assert_eq!(sanitize_output("a\x00b\x07c\x1bd\x7fe"), "abcde");
    }

    #[test]
    fn test_vertical_tab_and_form_feed_stripped() {
        assert_eq!(sanitize_output("a\x0Bb\x0Cc"), "abc");
    }

    #[test]
    fn test_large_output_truncated_with_marker() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let out = sanitize_output(&big);
        assert!(out.len() < big.len());
        assert!(out.ends_with("[Output truncated - size limit exceeded]"));
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // Multi-byte char straddling the cap must not split
        let mut big = "x".repeat(MAX_OUTPUT_BYTES - 1);
        big.push_str("日本語テキスト");
        let out = sanitize_output(&big);
        assert!(out.contains("[Output truncated"));
    }

    #[test]
    fn test_exactly_at_limit_not_truncated() {
        let exact = "y".repeat(MAX_OUTPUT_BYTES);
        let out = sanitize_output(&exact);
        assert!(!out.contains("[Output truncated"));
        assert_eq!(out.len(), MAX_OUTPUT_BYTES);
    }

    // ── validate_produced_file ──

    #[test]
    fn test_normal_file_accepted() {
        assert!(validate_produced_file("result.csv", 1024, 100));
        assert!(validate_produced_file("/mnt/data/plot.png", 1024, 100));
    }

    #[test]
    fn test_oversized_file_rejected() {
        assert!(!validate_produced_file("big.bin", 101 * 1024 * 1024, 100));
    }

    #[test]
    fn test_at_size_limit_accepted() {
        assert!(validate_produced_file("edge.bin", 100 * 1024 * 1024, 100));
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(!validate_produced_file("../etc/passwd", 10, 100));
        assert!(!validate_produced_file("/mnt/data/../escape.txt", 10, 100));
    }

    #[test]
    fn test_absolute_path_outside_workspace_rejected() {
        assert!(!validate_produced_file("/etc/shadow", 10, 100));
    }

    #[test]
    fn test_dangerous_extensions_rejected() {
        for name in ["x.exe", "x.bat", "x.cmd", "x.sh", "x.ps1", "x.scr", "x.com"] {
            assert!(!validate_produced_file(name, 10, 100), "{name}");
        }
    }

    #[test]
    fn test_dangerous_extension_case_insensitive() {
        assert!(!validate_produced_file("payload.EXE", 10, 100));
    }

    // ── mime types ──

    #[test]
    fn test_known_mime_types() {
        assert_eq!(guess_mime_type("a.csv"), "text/csv");
        assert_eq!(guess_mime_type("a.json"), "application/json");
        assert_eq!(guess_mime_type("a.PNG"), "image/png");
        assert_eq!(guess_mime_type("a.jpeg"), "image/jpeg");
    }

    #[test]
    fn test_unknown_mime_is_octet_stream() {
        assert_eq!(guess_mime_type("a.xyz"), "application/octet-stream");
        assert_eq!(guess_mime_type("no_extension"), "application/octet-stream");
    }
}
