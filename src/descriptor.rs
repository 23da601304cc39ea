use crate::error::DescriptorError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// A kernel test together with its build parameters, parsed from
/// `name[:m<size>][:D<flag>]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor {
    /// Descriptor string as given on the command line or in a suite file
    raw: String,
    /// Kernel test name (passed as `--kernel-test=<name>`)
    pub name: String,
    /// Simulated memory size (passed as `--memory-size=<n>`)
    pub memory_size: Option<u64>,
    /// Extra kernel compiler flags, one `--kernel-cflags=<flag>` each
    pub kernel_cflags: Vec<String>,
}

impl TestDescriptor {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Arguments for the configure script: the test name, then `passthrough`,
    /// then this descriptor's memory size and cflags, which thus take
    /// precedence over passthrough settings of the same option.
    pub fn configure_args(&self, passthrough: &[String]) -> Vec<String> {
        let mut args = vec![format!("--kernel-test={}", self.name)];
        args.extend(passthrough.iter().cloned());
        if let Some(size) = self.memory_size {
            args.push(format!("--memory-size={size}"));
        }
        for flag in &self.kernel_cflags {
            args.push(format!("--kernel-cflags={flag}"));
        }
        args
    }
}

impl FromStr for TestDescriptor {
    type Err = DescriptorError;

    fn from_str(descriptor: &str) -> Result<Self, Self::Err> {
        let mut parts = descriptor.split(':');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(DescriptorError::EmptyName(descriptor.to_string()));
        }

        let mut memory_size = None;
        let mut kernel_cflags = Vec::new();
        for part in parts {
            if let Some(value) = part.strip_prefix('m') {
                let size = value
                    .parse()
                    .map_err(|_| DescriptorError::InvalidMemorySize {
                        descriptor: descriptor.to_string(),
                        value: value.to_string(),
                    })?;
                memory_size = Some(size);
            } else if let Some(flag) = part.strip_prefix('D') {
                kernel_cflags.push(flag.to_string());
            } else {
                return Err(DescriptorError::UnknownDirective {
                    descriptor: descriptor.to_string(),
                    directive: part.to_string(),
                });
            }
        }

        Ok(Self {
            raw: descriptor.to_string(),
            name: name.to_string(),
            memory_size,
            kernel_cflags,
        })
    }
}

impl fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One test to run: its type column and its descriptor string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEntry {
    pub kind: String,
    pub name: String,
}

impl TestEntry {
    pub fn kernel(name: impl Into<String>) -> Self {
        Self {
            kind: "kernel".to_string(),
            name: name.into(),
        }
    }
}

/// Derives a filesystem-safe directory name for a test.
///
/// `/` becomes `__`, anything outside `[A-Za-z0-9_-]` becomes `_`. A short
/// name-based UUID of the unsanitized name is appended because sanitizing is
/// lossy (`a:m1` and `a_m1` would otherwise share a directory).
pub fn build_dir_name(test_name: &str) -> String {
    let clean: String = test_name
        .replace('/', "__")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, test_name.as_bytes()).simple();
    format!("{clean}-{}", &digest.to_string()[..8])
}

/// Parses a suite file: one `<type> <name>` pair per line, `#` comments and
/// blank lines skipped.
pub fn parse_suite(path: &Path, content: &str) -> Result<Vec<TestEntry>, DescriptorError> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [kind, name] => entries.push(TestEntry {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => {
                return Err(DescriptorError::InvalidSuiteLine {
                    path: path.to_path_buf(),
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

/// Reads and concatenates suite files in the given order.
pub fn load_suites(paths: &[PathBuf]) -> Result<Vec<TestEntry>, DescriptorError> {
    let mut entries = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::SuiteRead {
            path: path.clone(),
            source,
        })?;
        entries.extend(parse_suite(path, &content)?);
    }
    Ok(entries)
}
