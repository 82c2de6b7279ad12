//! Testlets: self-contained units of executable test logic.
//!
//! A [`Testlet`] pairs a name with a script source — an inline string or a
//! file on the host — plus the interpreter and environment it needs inside
//! the test environment. Packaging is a pure transformation: it produces
//! an interpreter-executable script and the final environment-variable
//! list, and nothing else.
//!
//! The body must be fully self-contained: it may not reference names
//! defined outside itself. That is a caller obligation, not something the
//! packager can check — a violation surfaces at remote execution time as
//! a name-resolution failure in the captured stderr.
//!
//! # Example
//!
//! ```
//! use cleanroom::testlet::Testlet;
//!
//! let testlet = Testlet::inline("smoke", "cat /root/in.txt")
//!     .env("LANG", "C");
//!
//! let packaged = testlet.package().unwrap();
//! assert!(packaged.script.starts_with("#!/bin/sh\n"));
//! ```

use std::path::PathBuf;

use crate::provider::ExecOutput;

/// Where a testlet body comes from.
///
/// The explicit script template: the author supplies the source unit
/// directly, rather than the engine extracting it from a live function.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// Body supplied inline as source text.
    Inline(String),

    /// Body read from a file on the host at packaging time.
    File(PathBuf),
}

/// Errors produced while packaging a testlet.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    /// The testlet body is empty (or whitespace only).
    #[error("testlet {0} has an empty body")]
    EmptyBody(String),

    /// The script source file could not be read.
    #[error("cannot read testlet source {path}: {source}")]
    UnreadableSource {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The script source file is not valid UTF-8.
    #[error("testlet source {0} is not valid UTF-8")]
    InvalidUtf8(PathBuf),
}

/// A unit of test logic to ship into a test environment.
///
/// Immutable once captured: the builder methods consume and return the
/// value, and execution consumes a shared reference.
#[derive(Debug, Clone)]
pub struct Testlet {
    /// Testlet name; also the script's file name inside the environment.
    pub name: String,

    /// Script body source.
    pub source: ScriptSource,

    /// Interpreter invoked on the packaged script. Default: `/bin/sh`.
    pub interpreter: String,

    /// Environment variables required by the body.
    pub env: Vec<(String, String)>,

    /// Module search paths for injected dependencies.
    pub search_paths: Vec<String>,

    /// Variable the search paths are published under. Default: `PATH`.
    ///
    /// Python payloads typically set this to `PYTHONPATH`.
    pub path_variable: String,
}

impl Testlet {
    /// Creates a testlet from an explicit script source.
    pub fn new(name: impl Into<String>, source: ScriptSource) -> Self {
        Self {
            name: name.into(),
            source,
            interpreter: "/bin/sh".to_string(),
            env: Vec::new(),
            search_paths: Vec::new(),
            path_variable: "PATH".to_string(),
        }
    }

    /// Creates a testlet from an inline body.
    pub fn inline(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(name, ScriptSource::Inline(body.into()))
    }

    /// Creates a testlet whose body is read from a host file.
    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, ScriptSource::File(path.into()))
    }

    /// Sets the interpreter invoked on the script.
    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Adds an environment variable for the body.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds a module search path for injected dependencies.
    pub fn search_path(mut self, path: impl Into<String>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Sets the variable name the search paths are published under.
    pub fn path_variable(mut self, name: impl Into<String>) -> Self {
        self.path_variable = name.into();
        self
    }

    /// Packages the testlet into an executable script.
    ///
    /// Pure transformation: resolves the body, prepends a shebang when the
    /// body does not carry one, and folds the search paths into the final
    /// environment list under [`path_variable`](Self::path_variable).
    ///
    /// # Errors
    ///
    /// [`PackagingError`] when the body is empty or a file source cannot
    /// be read as UTF-8 text.
    pub fn package(&self) -> Result<PackagedTestlet, PackagingError> {
        let body = match &self.source {
            ScriptSource::Inline(body) => body.clone(),
            ScriptSource::File(path) => {
                let bytes =
                    std::fs::read(path).map_err(|source| PackagingError::UnreadableSource {
                        path: path.clone(),
                        source,
                    })?;
                String::from_utf8(bytes)
                    .map_err(|_| PackagingError::InvalidUtf8(path.clone()))?
            }
        };

        if body.trim().is_empty() {
            return Err(PackagingError::EmptyBody(self.name.clone()));
        }

        let mut script = String::new();
        if !body.starts_with("#!") {
            script.push_str("#!");
            script.push_str(&self.interpreter);
            script.push('\n');
        }
        script.push_str(&body);
        if !script.ends_with('\n') {
            script.push('\n');
        }

        let mut env = self.env.clone();
        if !self.search_paths.is_empty() {
            env.push((self.path_variable.clone(), self.search_paths.join(":")));
        }

        Ok(PackagedTestlet {
            name: self.name.clone(),
            interpreter: self.interpreter.clone(),
            script,
            env,
        })
    }
}

/// A packaged, injectable testlet script.
///
/// When executed by `interpreter`, the script runs the body and exits
/// with the body's own exit code, writing stdout/stderr to capturable
/// streams.
#[derive(Debug, Clone)]
pub struct PackagedTestlet {
    /// Testlet name.
    pub name: String,

    /// Interpreter the script expects.
    pub interpreter: String,

    /// Executable script text.
    pub script: String,

    /// Environment variables for execution, search paths included.
    pub env: Vec<(String, String)>,
}

/// The outcome of executing one testlet in one environment.
///
/// Immutable once produced.
#[derive(Debug, Clone)]
pub struct TestletResult {
    /// Name of the environment the testlet ran in.
    pub environment: String,

    /// Exit code of the testlet body.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl TestletResult {
    /// Builds a result from a raw command outcome.
    pub fn from_output(environment: impl Into<String>, output: ExecOutput) -> Self {
        Self {
            environment: environment.into(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Returns `true` if the testlet exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_prepends_shebang() {
        let packaged = Testlet::inline("t", "echo ok").package().unwrap();
        assert_eq!(packaged.script, "#!/bin/sh\necho ok\n");
        assert_eq!(packaged.interpreter, "/bin/sh");
    }

    #[test]
    fn test_package_keeps_existing_shebang() {
        let packaged = Testlet::inline("t", "#!/usr/bin/env python3\nprint('hi')")
            .interpreter("python3")
            .package()
            .unwrap();
        assert!(packaged.script.starts_with("#!/usr/bin/env python3\n"));
        assert!(packaged.script.ends_with("print('hi')\n"));
    }

    #[test]
    fn test_package_folds_search_paths_into_env() {
        let packaged = Testlet::inline("t", "import dep")
            .interpreter("python3")
            .path_variable("PYTHONPATH")
            .search_path("/root/init/deps")
            .search_path("/root/init/extra")
            .env("DEBUG", "1")
            .package()
            .unwrap();

        assert!(packaged.env.contains(&("DEBUG".into(), "1".into())));
        assert!(
            packaged
                .env
                .contains(&("PYTHONPATH".into(), "/root/init/deps:/root/init/extra".into()))
        );
    }

    #[test]
    fn test_package_empty_body_fails() {
        let err = Testlet::inline("empty", "  \n ").package().unwrap_err();
        assert!(matches!(err, PackagingError::EmptyBody(name) if name == "empty"));
    }

    #[test]
    fn test_package_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "echo from-file").unwrap();

        let packaged = Testlet::from_file("t", file.path()).package().unwrap();
        assert!(packaged.script.contains("echo from-file"));
    }

    #[test]
    fn test_package_missing_file_fails() {
        let err = Testlet::from_file("t", "/no/such/script")
            .package()
            .unwrap_err();
        assert!(matches!(err, PackagingError::UnreadableSource { .. }));
    }

    #[test]
    fn test_result_success() {
        let result = TestletResult {
            environment: "test-jammy".into(),
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        assert!(result.success());
    }
}
