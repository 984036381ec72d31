//! Java runtime probing and launch command assembly for the managed node.

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::SupervisorError;

/// Runtime majors the node release is known to run on.
pub const SUPPORTED_RUNTIMES: RangeInclusive<u32> = 11..=21;

/// Machine architectures the node ships native libraries for.
pub const SUPPORTED_ARCHS: &[&str] = &["x86_64", "aarch64"];

// `java -version` antes de JEP 223: version "1.8.0_292"
const PRE_223_PATTERN: &str = r#"version "1\.(?P<major>[0-8])\.(?P<minor>0)(?:_\d+)?(?:-.*)?""#;
// JEP 223 en adelante: version "17.0.2", version "21", version "11.0.20-ea"
const JEP_223_PATTERN: &str = r#"version "(?P<major>\d+)(?:\.(?P<minor>\d+))?(?:\.\d+)*(-[a-zA-Z0-9]+)?""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl RuntimeVersion {
    pub fn is_supported(&self) -> bool {
        SUPPORTED_RUNTIMES.contains(&self.major)
    }
}

/// Compiled `java -version` patterns.
pub struct VersionPatterns {
    pre_223: Regex,
    jep_223: Regex,
}

impl VersionPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pre_223: Regex::new(PRE_223_PATTERN)?,
            jep_223: Regex::new(JEP_223_PATTERN)?,
        })
    }

    /// Finds the first line carrying a version string.
    pub fn parse(&self, output: &str) -> Option<RuntimeVersion> {
        output.lines().find_map(|line| {
            let caps = self
                .pre_223
                .captures(line)
                .or_else(|| self.jep_223.captures(line))?;
            let major = caps.name("major")?.as_str().parse().ok()?;
            let minor = caps
                .name("minor")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            Some(RuntimeVersion { major, minor })
        })
    }
}

/// Runs `<java> -version` and parses what it prints on stderr.
pub async fn detect(java_path: &str) -> Result<RuntimeVersion, SupervisorError> {
    let output = Command::new(java_path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| SupervisorError::RuntimeNotFound(format!("{java_path}: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!("Salida de {} -version: {}", java_path, stderr.trim());

    let version = VersionPatterns::new()?
        .parse(&stderr)
        .ok_or_else(|| SupervisorError::UnexpectedRuntimeOutput(stderr.trim().to_string()))?;

    if !version.is_supported() {
        return Err(SupervisorError::UnsupportedRuntime(version));
    }
    info!("☕ Runtime detectado: {} ({})", version, java_path);
    Ok(version)
}

/// Where the supervisor learns about the host machine and its runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeDetector: Send + Sync {
    fn arch(&self) -> String;

    async fn detect(&self, java_path: &str) -> Result<RuntimeVersion, SupervisorError>;
}

/// Inspects the real machine and the configured `java` executable.
#[derive(Debug, Default, Clone, Copy)]
pub struct JavaDetector;

#[async_trait]
impl RuntimeDetector for JavaDetector {
    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    async fn detect(&self, java_path: &str) -> Result<RuntimeVersion, SupervisorError> {
        detect(java_path).await
    }
}

pub fn check_arch(arch: &str) -> Result<(), SupervisorError> {
    if SUPPORTED_ARCHS.contains(&arch) {
        Ok(())
    } else {
        Err(SupervisorError::UnsupportedArch(arch.to_string()))
    }
}

/// `<digits><M|G>`, case-insensitive.
fn is_heap_size(value: &str) -> bool {
    let Some((unit_at, unit)) = value.char_indices().last() else {
        return false;
    };
    let digits = &value[..unit_at];
    matches!(unit, 'M' | 'm' | 'G' | 'g') && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Arguments after the runtime executable. Flags depend on the runtime
/// major; an invalid max heap is dropped rather than passed through.
pub fn launch_args(version: RuntimeVersion, xms: &str, xmx: Option<&str>, jar: &Path) -> Vec<String> {
    let mut args = Vec::new();

    if version.major < 12 {
        args.push("-Dsun.zip.disableMemoryMapping=true".to_string());
    }
    if version.major >= 13 {
        args.push("-Djdk.tls.client.protocols=TLSv1.2".to_string());
    }

    if is_heap_size(xms) {
        args.push(format!("-Xms{xms}"));
    }
    match xmx {
        Some(xmx) if is_heap_size(xmx) => args.push(format!("-Xmx{xmx}")),
        Some(xmx) => tracing::warn!("JAVA_XMX inválido '{}', se ignora", xmx),
        None => {}
    }

    args.push("-jar".to_string());
    args.push(jar.display().to_string());
    args
}
