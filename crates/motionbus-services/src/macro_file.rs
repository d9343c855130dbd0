//! Macro files and the resolution of firmware file names to local paths.
//!
//! The firmware names files relative to its virtual SD card, e.g.
//! `0:/sys/homeall.g` or just `homeall.g`. [`FileResolver`] maps those onto
//! the configured base directory and applies the fallbacks the firmware
//! expects for a few well-known system macros.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use motionbus_core::{Code, CodeChannel, ParseError};

/// Directory used for macro names without a directory part.
pub const SYSTEM_DIRECTORY: &str = "sys";

pub const CONFIG_FILE: &str = "config.g";
pub const CONFIG_BACKUP_FILE: &str = "config.g.bak";

#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("macro file {0} not found")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{file}:{line}: {source}")]
    Parse {
        file: String,
        line: usize,
        #[source]
        source: ParseError,
    },
}

// ── Resolution ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileResolver {
    base_directory: PathBuf,
}

/// Result of looking up a macro file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(PathBuf),
    /// The requested file is missing but a substitute exists.
    Fallback { path: PathBuf, requested: PathBuf },
    Missing(PathBuf),
}

impl FileResolver {
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Map a firmware file name onto the local filesystem.
    pub fn to_physical(&self, name: &str, default_directory: &str) -> PathBuf {
        let mut name = name.trim();
        // drive prefix such as "0:/"
        if let Some((drive, rest)) = name.split_once(':') {
            if drive.chars().all(|c| c.is_ascii_digit()) {
                name = rest;
            }
        }
        let relative = name.trim_start_matches('/');
        if name.contains('/') {
            self.base_directory.join(relative)
        } else {
            self.base_directory.join(default_directory).join(relative)
        }
    }

    /// Find a macro, applying the config.g and probe macro fallbacks.
    pub async fn resolve_macro(&self, name: &str) -> Resolution {
        let path = self.to_physical(name, SYSTEM_DIRECTORY);
        if exists(&path).await {
            return Resolution::Found(path);
        }

        if let Some(fallback) = fallback_name(&path) {
            let fallback = path.with_file_name(fallback);
            if exists(&fallback).await {
                return Resolution::Fallback {
                    path: fallback,
                    requested: path,
                };
            }
        }
        Resolution::Missing(path)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// deployprobe3.g → deployprobe.g, retractprobe1.g → retractprobe.g,
/// config.g → config.g.bak.
fn fallback_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name == CONFIG_FILE {
        return Some(CONFIG_BACKUP_FILE.to_string());
    }
    for prefix in ["deployprobe", "retractprobe"] {
        if let Some(rest) = file_name.strip_prefix(prefix) {
            let number = rest.strip_suffix(".g")?;
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                return Some(format!("{prefix}.g"));
            }
        }
    }
    None
}

// ── Macro files ───────────────────────────────────────────────────────────────

/// An open macro file read one code at a time.
pub struct MacroFile {
    name: String,
    path: PathBuf,
    channel: CodeChannel,
    reader: Option<BufReader<File>>,
    line: String,
    line_number: usize,
    position: u64,
}

impl std::fmt::Debug for MacroFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroFile")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("line", &self.line_number)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl MacroFile {
    pub async fn open(name: &str, path: PathBuf, channel: CodeChannel) -> Result<Self, MacroError> {
        let file = File::open(&path).await.map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => MacroError::NotFound(name.to_string()),
            _ => MacroError::Io {
                path: path.clone(),
                source,
            },
        })?;
        Ok(Self {
            name: name.to_string(),
            path,
            channel,
            reader: Some(BufReader::new(file)),
            line: String::new(),
            line_number: 0,
            position: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the file is exhausted or was aborted.
    pub fn is_finished(&self) -> bool {
        self.reader.is_none()
    }

    /// Stop reading. Codes already read are unaffected.
    pub fn abort(&mut self) {
        self.reader = None;
    }

    /// Read the next code, skipping blank and comment lines.
    /// Returns `Ok(None)` at the end of the file.
    pub async fn read_code(&mut self) -> Result<Option<Code>, MacroError> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            self.line.clear();
            let consumed = match reader.read_line(&mut self.line).await {
                Ok(0) => {
                    self.reader = None;
                    return Ok(None);
                }
                Ok(n) => n,
                Err(source) => {
                    self.reader = None;
                    return Err(MacroError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            };

            self.line_number += 1;
            // positions count the bytes on disk, line endings included
            let position = self.position;
            self.position += consumed as u64;
            let line = self.line.trim_end_matches(['\r', '\n']);

            match Code::parse(line, self.channel) {
                Ok(Some(mut code)) => {
                    code.file_position = u32::try_from(position).ok();
                    return Ok(Some(code));
                }
                Ok(None) => continue,
                Err(source) => {
                    self.reader = None;
                    return Err(MacroError::Parse {
                        file: self.name.clone(),
                        line: self.line_number,
                        source,
                    });
                }
            }
        }
    }
}
