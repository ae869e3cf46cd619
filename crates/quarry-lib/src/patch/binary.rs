//! In-place string replacement inside executables and archives.
//!
//! Replacements never change file length. A sidecar flag file records the
//! applied rule set so repeated invocations are idempotent, and a `.bak`
//! copy of the pristine target guarantees a clean base when rules change.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{Error, Result};

/// Archive entry names eligible for rewriting.
const ARCHIVE_ENTRY_SUFFIXES: &[&str] = &[".class", ".properties", ".json", ".xml", ".yml"];

/// Byte encoding applied to rule strings before scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Utf8,
    Utf16Le,
}

fn encode(s: &str, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Utf8 => s.as_bytes().to_vec(),
        Encoding::Utf16Le => s
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    }
}

/// A single replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplacementRule {
    /// Literal overwrite; both strings must share encoded length.
    Simple { old: String, new: String },
    /// Domain-style replacement where only the final character differs in
    /// place: the stub (all but the last character) is matched, the
    /// following character is verified against the old final character, and
    /// both regions are rewritten. Stubs and final characters must each
    /// share encoded length.
    SmartDomain { old: String, new: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub replacements: u64,
    pub files_modified: u64,
}

/// Sidecar recording that a target was already patched with a rule set.
#[derive(Debug, Serialize, Deserialize)]
struct PatchFlag {
    patched_at: String,
    target: String,
    rules_digest: String,
}

/// Split a rule into scan/overwrite byte sequences, validating the length
/// invariants up front.
enum CompiledRule {
    Simple {
        old: Vec<u8>,
        new: Vec<u8>,
    },
    SmartDomain {
        stub_old: Vec<u8>,
        last_old: Vec<u8>,
        stub_new: Vec<u8>,
        last_new: Vec<u8>,
    },
}

fn compile_rule(rule: &ReplacementRule, encoding: Encoding) -> Result<CompiledRule> {
    match rule {
        ReplacementRule::Simple { old, new } => {
            if old.is_empty() {
                return Err(Error::InvalidReplacement("empty search string".into()));
            }
            let old_b = encode(old, encoding);
            let new_b = encode(new, encoding);
            if old_b.len() != new_b.len() {
                return Err(Error::InvalidReplacement(format!(
                    "'{old}' and '{new}' differ in encoded length ({} vs {})",
                    old_b.len(),
                    new_b.len()
                )));
            }
            Ok(CompiledRule::Simple { old: old_b, new: new_b })
        }
        ReplacementRule::SmartDomain { old, new } => {
            let (old_stub, old_last) = split_last_char(old)?;
            let (new_stub, new_last) = split_last_char(new)?;
            let stub_old = encode(old_stub, encoding);
            let stub_new = encode(new_stub, encoding);
            let last_old = encode(old_last, encoding);
            let last_new = encode(new_last, encoding);
            if stub_old.len() != stub_new.len() {
                return Err(Error::InvalidReplacement(format!(
                    "stubs of '{old}' and '{new}' differ in encoded length ({} vs {})",
                    stub_old.len(),
                    stub_new.len()
                )));
            }
            if last_old.len() != last_new.len() {
                return Err(Error::InvalidReplacement(format!(
                    "final characters of '{old}' and '{new}' differ in encoded length"
                )));
            }
            Ok(CompiledRule::SmartDomain {
                stub_old,
                last_old,
                stub_new,
                last_new,
            })
        }
    }
}

fn split_last_char(s: &str) -> Result<(&str, &str)> {
    let last = s
        .char_indices()
        .last()
        .filter(|(idx, _)| *idx > 0)
        .ok_or_else(|| {
            Error::InvalidReplacement(format!("'{s}' is too short for a domain rule"))
        })?;
    Ok((&s[..last.0], &s[last.0..]))
}

impl CompiledRule {
    /// Left-to-right scan advancing one byte after each match, so
    /// overlapping occurrences are considered.
    fn apply(&self, buf: &mut [u8]) -> u64 {
        match self {
            CompiledRule::Simple { old, new } => {
                let mut count = 0u64;
                let mut i = 0usize;
                while i + old.len() <= buf.len() {
                    if &buf[i..i + old.len()] == old.as_slice() {
                        buf[i..i + new.len()].copy_from_slice(new);
                        count += 1;
                    }
                    i += 1;
                }
                count
            }
            CompiledRule::SmartDomain {
                stub_old,
                last_old,
                stub_new,
                last_new,
            } => {
                let mut count = 0u64;
                let mut i = 0usize;
                let needed = stub_old.len() + last_old.len();
                while i + needed <= buf.len() {
                    let stub_matches = &buf[i..i + stub_old.len()] == stub_old.as_slice();
                    if stub_matches {
                        let tail = &buf[i + stub_old.len()..i + needed];
                        if tail == last_old.as_slice() {
                            buf[i..i + stub_new.len()].copy_from_slice(stub_new);
                            buf[i + stub_new.len()..i + needed].copy_from_slice(last_new);
                            count += 1;
                        }
                    }
                    i += 1;
                }
                count
            }
        }
    }
}

/// Applies replacement rules to a file in place.
pub struct BinaryPatcher;

impl BinaryPatcher {
    /// Patch `path` with `rules` under `encoding`.
    ///
    /// Idempotent: a sidecar flag recording the same rule digest short
    /// circuits with zero replacements. When the rules change, the pristine
    /// `.bak` copy is restored first so rules never stack.
    pub async fn patch(
        path: &Path,
        rules: &[ReplacementRule],
        encoding: Encoding,
    ) -> Result<PatchReport> {
        let compiled: Vec<CompiledRule> = rules
            .iter()
            .map(|r| compile_rule(r, encoding))
            .collect::<Result<_>>()?;
        let digest = rules_digest(rules, encoding);
        let is_archive = is_archive_target(path);
        let flag_path = flag_path(path, is_archive);

        if let Some(flag) = read_flag(&flag_path).await {
            if flag.rules_digest == digest {
                log::debug!("{} already patched with this rule set", path.display());
                return Ok(PatchReport::default());
            }
        }

        let backup = backup_path(path);
        if tokio::fs::metadata(&backup).await.is_ok() {
            // Restore the clean base so the new rule set applies to pristine
            // bytes.
            tokio::fs::copy(&backup, path).await?;
        } else {
            tokio::fs::copy(path, &backup).await?;
        }

        let original = tokio::fs::read(path).await?;
        let (patched, report) = if is_archive {
            patch_archive(&original, &compiled)?
        } else {
            let mut buf = original.clone();
            let mut replacements = 0u64;
            for rule in &compiled {
                replacements += rule.apply(&mut buf);
            }
            let modified = u64::from(buf != original);
            // In-place rewriting never changes the target's length; only
            // archive recompression may.
            debug_assert_eq!(buf.len(), original.len());
            (
                buf,
                PatchReport {
                    replacements,
                    files_modified: modified,
                },
            )
        };

        if patched != original {
            tokio::fs::write(path, &patched).await?;
        }

        write_flag(&flag_path, path, &digest).await?;
        log::info!(
            "patched {} ({} replacements)",
            path.display(),
            report.replacements
        );
        Ok(report)
    }
}

/// Rewrite eligible entries of a ZIP/JAR in memory. Untouched entries are
/// copied raw so compression and metadata survive.
fn patch_archive(original: &[u8], rules: &[CompiledRule]) -> Result<(Vec<u8>, PatchReport)> {
    let mut archive = ZipArchive::new(Cursor::new(original))?;
    let mut out = ZipWriter::new(Cursor::new(Vec::with_capacity(original.len())));
    let mut report = PatchReport::default();

    for index in 0..archive.len() {
        let eligible = {
            let entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            ARCHIVE_ENTRY_SUFFIXES.iter().any(|s| name.ends_with(s))
        };

        if !eligible {
            let entry = archive.by_index_raw(index)?;
            out.raw_copy_file(entry)?;
            continue;
        }

        let mut entry = archive.by_index(index)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;

        let mut replacements = 0u64;
        for rule in rules {
            replacements += rule.apply(&mut buf);
        }

        if replacements == 0 {
            drop(entry);
            let raw = archive.by_index_raw(index)?;
            out.raw_copy_file(raw)?;
            continue;
        }

        report.replacements += replacements;
        report.files_modified += 1;

        let name = entry.name().to_string();
        let options = SimpleFileOptions::default().compression_method(entry.compression());
        drop(entry);
        out.start_file(name, options)?;
        out.write_all(&buf)
            .map_err(|e| Error::Archive(e.to_string()))?;
    }

    let cursor = out.finish()?;
    let bytes = cursor.into_inner();

    // Entry bodies keep their length, but recompression can move archive
    // offsets; only the unchanged-input case is required to be identical.
    if report.files_modified == 0 {
        return Ok((original.to_vec(), report));
    }
    Ok((bytes, report))
}

fn is_archive_target(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip") || e.eq_ignore_ascii_case("jar"))
        .unwrap_or(false)
}

fn flag_path(path: &Path, is_archive: bool) -> PathBuf {
    if is_archive {
        path.parent()
            .unwrap_or_else(|| Path::new("."))
            .join("patched_server.json")
    } else {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("target");
        path.with_file_name(format!("{name}.patched_custom"))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("target");
    path.with_file_name(format!("{name}.bak"))
}

fn rules_digest(rules: &[ReplacementRule], encoding: Encoding) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&(rules, encoding)).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

async fn read_flag(path: &Path) -> Option<PatchFlag> {
    let data = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&data).ok()
}

async fn write_flag(flag: &Path, target: &Path, digest: &str) -> Result<()> {
    let record = PatchFlag {
        patched_at: chrono::Utc::now().to_rfc3339(),
        target: target.display().to_string(),
        rules_digest: digest.to_string(),
    };
    let json = serde_json::to_vec_pretty(&record)?;
    let tmp = flag.with_extension("tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, flag).await?;
    Ok(())
}
