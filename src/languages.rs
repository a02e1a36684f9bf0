use std::collections::HashMap;
use std::sync::LazyLock;

/* ============================= LANGUAGE DESCRIPTOR ============================= */

/// Complete configuration for one supported language.
///
/// This is the single source of truth for all language-specific behaviour:
/// image selection, resource multipliers, execution command, and any
/// environment overrides the sidecar needs. All per-language dispatch flows
/// from this table; there is no per-language code anywhere else.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    /// Short code used on the wire: "py", "js", "go", ...
    pub code: &'static str,
    /// Full display name.
    pub name: &'static str,
    /// Base runtime image name (registry prefix and tag applied by config).
    pub image: &'static str,
    /// UID the language container runs as.
    pub user_id: i64,
    /// Source file extension, without the dot.
    pub file_extension: &'static str,
    /// Command the sidecar runs to execute the submitted code.
    pub execution_command: &'static str,
    /// Whether code is piped to the interpreter via stdin.
    pub uses_stdin: bool,
    /// Multiplier applied to the base execution timeout.
    pub timeout_multiplier: f64,
    /// Multiplier applied to the base memory limit.
    pub memory_multiplier: f64,
    /// Extra environment for the sidecar when network isolation is on.
    pub isolated_env: &'static [(&'static str, &'static str)],
    /// Whether the interpreter namespace can be captured/restored.
    pub stateful: bool,
}

/* ============================= TABLE ============================= */

const LANGUAGES: &[LanguageConfig] = &[
    LanguageConfig {
        code: "py",
        name: "Python",
        image: "python",
        user_id: 65532,
        file_extension: "py",
        execution_command: "python3 -",
        uses_stdin: true,
        timeout_multiplier: 1.0,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: true,
    },
    LanguageConfig {
        code: "js",
        name: "JavaScript",
        image: "javascript",
        user_id: 65532,
        file_extension: "js",
        execution_command: "node",
        uses_stdin: true,
        timeout_multiplier: 1.0,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "ts",
        name: "TypeScript",
        image: "typescript",
        user_id: 65532,
        file_extension: "ts",
        execution_command: "tsc /mnt/data/code.ts --outDir /mnt/data --module commonjs --target ES2019 && node /mnt/data/code.js",
        uses_stdin: false,
        // Cold-start compilation is slow
        timeout_multiplier: 2.0,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "go",
        name: "Go",
        image: "go",
        user_id: 65532,
        file_extension: "go",
        execution_command: "go build -o code code.go && ./code",
        uses_stdin: false,
        timeout_multiplier: 1.5,
        memory_multiplier: 1.2,
        // Without these, isolated builds stall waiting on DNS for the
        // module proxy instead of failing fast.
        isolated_env: &[("GOPROXY", "off"), ("GOSUMDB", "off")],
        stateful: false,
    },
    LanguageConfig {
        code: "java",
        name: "Java",
        image: "java",
        user_id: 65532,
        file_extension: "java",
        execution_command: "javac Code.java && java Code",
        uses_stdin: false,
        timeout_multiplier: 2.0,
        memory_multiplier: 1.5,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "c",
        name: "C",
        image: "c-cpp",
        user_id: 65532,
        file_extension: "c",
        execution_command: "gcc -o code code.c && ./code",
        uses_stdin: false,
        timeout_multiplier: 1.5,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "cpp",
        name: "C++",
        image: "c-cpp",
        user_id: 65532,
        file_extension: "cpp",
        execution_command: "g++ -o code code.cpp && ./code",
        uses_stdin: false,
        timeout_multiplier: 1.5,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "php",
        name: "PHP",
        image: "php",
        user_id: 65532,
        file_extension: "php",
        execution_command: "php",
        uses_stdin: true,
        timeout_multiplier: 1.0,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "rs",
        name: "Rust",
        image: "rust",
        user_id: 65532,
        file_extension: "rs",
        execution_command: "rustc code.rs -o code && ./code",
        uses_stdin: false,
        timeout_multiplier: 3.0,
        memory_multiplier: 1.5,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "r",
        name: "R",
        image: "r",
        user_id: 65532,
        file_extension: "r",
        execution_command: "Rscript /dev/stdin",
        uses_stdin: true,
        timeout_multiplier: 1.5,
        memory_multiplier: 1.2,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "f90",
        name: "Fortran",
        image: "fortran",
        user_id: 65532,
        file_extension: "f90",
        execution_command: "gfortran -o code code.f90 && ./code",
        uses_stdin: false,
        timeout_multiplier: 2.0,
        memory_multiplier: 1.0,
        isolated_env: &[],
        stateful: false,
    },
    LanguageConfig {
        code: "d",
        name: "D",
        image: "d",
        user_id: 65532,
        file_extension: "d",
        execution_command: "ldc2 code.d -of=code && ./code",
        uses_stdin: false,
        timeout_multiplier: 2.0,
        memory_multiplier: 1.2,
        isolated_env: &[],
        stateful: false,
    },
];

static LANGUAGE_MAP: LazyLock<HashMap<&'static str, &'static LanguageConfig>> =
    LazyLock::new(|| LANGUAGES.iter().map(|l| (l.code, l)).collect());

/* ============================= LOOKUPS ============================= */

/// Look up a language by its short code (case-insensitive).
pub fn get_language(code: &str) -> Option<&'static LanguageConfig> {
    LANGUAGE_MAP.get(code.to_lowercase().trim()).copied()
}

pub fn is_supported(code: &str) -> bool {
    get_language(code).is_some()
}

/// All supported language codes, in table order.
pub fn supported_codes() -> Vec<&'static str> {
    LANGUAGES.iter().map(|l| l.code).collect()
}

/// Full runtime image for a language: `{registry}-{image}:{tag}`.
pub fn image_for(lang: &LanguageConfig, registry: &str, tag: &str) -> String {
    if registry.is_empty() {
        format!("{}:{}", lang.image, tag)
    } else {
        format!("{}-{}:{}", registry, lang.image, tag)
    }
}

/* ============================= TESTS ============================= */
