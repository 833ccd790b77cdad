// Copyright 2021 The yadcc developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cache-entry wire format and the digests that index the distributed cache.
//!
//! Inner form (what travels over RPC and sits behind the integrity header):
//!
//! ```text
//! [meta_size: u32 LE][files_size: u32 LE][reserved: u32 LE]
//! [meta: bincode CacheMeta][files: bincode Vec<(String, Vec<u8>)>]
//! ```
//!
//! Sealed form (what the disk cache stores): a 64-byte header (32 bytes of
//! blake3 over the payload, 32 reserved) followed by the inner form. Fixed
//! little-endian; cache files do not migrate across hosts.

use bincode;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

use errors::*;
use protocol::{EnvironmentDesc, PatchLocations};
use util;

pub const SEALED_HEADER_SIZE: usize = 64;
const INNER_HEADER_SIZE: usize = 12;

/// Task-specific payload piggybacked on a cache entry, a poor man's `Any`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraInfo {
    pub type_tag: String,
    pub payload: Vec<u8>,
}

pub const CXX_EXTRA_INFO_TAG: &str = "yadcc.CxxCompilationExtraInfo";

/// Extra info attached to C++ compilation results: where, in each output
/// file, the servant's workspace path occurs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CxxCompilationExtraInfo {
    pub file_name_patches: HashMap<String, PatchLocations>,
}

impl ExtraInfo {
    pub fn pack_cxx(info: &CxxCompilationExtraInfo) -> Result<ExtraInfo> {
        Ok(ExtraInfo {
            type_tag: CXX_EXTRA_INFO_TAG.to_owned(),
            payload: bincode::serialize(info)?,
        })
    }

    pub fn unpack_cxx(&self) -> Result<CxxCompilationExtraInfo> {
        if self.type_tag != CXX_EXTRA_INFO_TAG {
            bail!(ErrorKind::InvalidArgument(format!(
                "unexpected extra info type [{}]",
                self.type_tag
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// A compilation result as stored in the distributed cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    pub exit_code: i32,
    pub standard_output: String,
    pub standard_error: String,
    pub extra_info: ExtraInfo,
    /// Output files keyed by extension suffix (e.g. `".o"`).
    pub files: Vec<(String, Vec<u8>)>,
}

#[derive(Serialize, Deserialize)]
struct CacheMeta {
    exit_code: i32,
    standard_output: String,
    standard_error: String,
    extra_info: ExtraInfo,
    files_digest: [u8; 32],
}

/// Serializes `entry` into its inner form.
pub fn write_cache_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    let files = bincode::serialize(&entry.files)?;
    let meta = bincode::serialize(&CacheMeta {
        exit_code: entry.exit_code,
        standard_output: entry.standard_output.clone(),
        standard_error: entry.standard_error.clone(),
        extra_info: entry.extra_info.clone(),
        files_digest: util::blake3_of(&files),
    })?;

    let mut result = Vec::with_capacity(INNER_HEADER_SIZE + meta.len() + files.len());
    let mut header = [0u8; INNER_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], meta.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], files.len() as u32);
    // header[8..12] reserved.
    result.extend_from_slice(&header);
    result.extend_from_slice(&meta);
    result.extend_from_slice(&files);
    Ok(result)
}

/// Parses the inner form back. Any structural damage, including a mismatch
/// of the files digest, yields `CorruptedEntry`.
pub fn try_parse_cache_entry(bytes: &[u8]) -> Result<CacheEntry> {
    if bytes.len() < INNER_HEADER_SIZE {
        bail!(ErrorKind::CorruptedEntry);
    }
    let meta_size = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let files_size = LittleEndian::read_u32(&bytes[4..8]) as usize;
    if bytes.len() != INNER_HEADER_SIZE + meta_size + files_size {
        bail!(ErrorKind::CorruptedEntry);
    }
    let meta_bytes = &bytes[INNER_HEADER_SIZE..INNER_HEADER_SIZE + meta_size];
    let files_bytes = &bytes[INNER_HEADER_SIZE + meta_size..];

    let meta: CacheMeta = match bincode::deserialize(meta_bytes) {
        Ok(m) => m,
        Err(_) => bail!(ErrorKind::CorruptedEntry),
    };
    if meta.files_digest != util::blake3_of(files_bytes) {
        bail!(ErrorKind::CorruptedEntry);
    }
    let files: Vec<(String, Vec<u8>)> = match bincode::deserialize(files_bytes) {
        Ok(f) => f,
        Err(_) => bail!(ErrorKind::CorruptedEntry),
    };
    Ok(CacheEntry {
        exit_code: meta.exit_code,
        standard_output: meta.standard_output,
        standard_error: meta.standard_error,
        extra_info: meta.extra_info,
        files,
    })
}

/// Prepends the integrity header for on-disk storage.
pub fn seal_entry(payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(SEALED_HEADER_SIZE + payload.len());
    result.extend_from_slice(&util::blake3_of(payload));
    result.extend_from_slice(&[0u8; 32]);
    result.extend_from_slice(payload);
    result
}

/// Re-checks the integrity header and returns the payload. Detects disk
/// corruption and partial writes.
pub fn verify_and_strip_header(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < SEALED_HEADER_SIZE {
        bail!(ErrorKind::CorruptedEntry);
    }
    let payload = &bytes[SEALED_HEADER_SIZE..];
    if bytes[..32] != util::blake3_of(payload) {
        bail!(ErrorKind::CorruptedEntry);
    }
    Ok(payload)
}

/// Cache key for a C++ compilation: stable digest over everything that
/// determines the output. Hashed together to keep key length manageable.
pub fn get_cxx_cache_entry_key(
    env: &EnvironmentDesc,
    invocation_arguments: &str,
    source_digest: &str,
) -> String {
    let mut digest = util::Digest::new();
    digest.update(b"using-extra-info");
    digest.update(env.compiler_digest.as_bytes());
    digest.update(invocation_arguments.as_bytes());
    digest.update(source_digest.as_bytes());
    format!("yadcc-cxx2-entry-{}", digest.finish())
}

/// Same inputs under a different salt; identifies identical in-flight tasks
/// for dedup without colliding with the cache-key space.
pub fn get_cxx_task_digest(
    env: &EnvironmentDesc,
    invocation_arguments: &str,
    source_digest: &str,
) -> String {
    let mut digest = util::Digest::new();
    digest.update(b"cxx2");
    digest.update(env.compiler_digest.as_bytes());
    digest.update(invocation_arguments.as_bytes());
    digest.update(source_digest.as_bytes());
    digest.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use protocol::PatchLocation;

    fn make_entry() -> CacheEntry {
        let mut patches = CxxCompilationExtraInfo::default();
        patches.file_name_patches.insert(
            ".o".to_owned(),
            PatchLocations {
                locations: vec![PatchLocation {
                    position: 10,
                    total_size: 100,
                    suffix_to_keep: 8,
                }],
            },
        );
        CacheEntry {
            exit_code: 0,
            standard_output: "warning: blah".to_owned(),
            standard_error: String::new(),
            extra_info: ExtraInfo::pack_cxx(&patches).unwrap(),
            files: vec![(".o".to_owned(), b"OBJECT BYTES".to_vec())],
        }
    }

    #[test]
    fn test_round_trip() {
        let entry = make_entry();
        let bytes = write_cache_entry(&entry).unwrap();
        let parsed = try_parse_cache_entry(&bytes).unwrap();
        assert_eq!(parsed, entry);
        let info = parsed.extra_info.unpack_cxx().unwrap();
        assert_eq!(info.file_name_patches[".o"].locations[0].position, 10);
    }

    #[test]
    fn test_sealed_round_trip() {
        let entry = make_entry();
        let inner = write_cache_entry(&entry).unwrap();
        let sealed = seal_entry(&inner);
        let stripped = verify_and_strip_header(&sealed).unwrap();
        assert_eq!(stripped, &inner[..]);
    }

    #[test]
    fn test_any_single_byte_mutation_is_detected() {
        let entry = make_entry();
        let sealed = seal_entry(&write_cache_entry(&entry).unwrap());
        for i in 0..sealed.len() {
            // Reserved header bytes are not covered by the digest.
            if i >= 32 && i < SEALED_HEADER_SIZE {
                continue;
            }
            let mut mutated = sealed.clone();
            mutated[i] ^= 0x01;
            assert!(
                verify_and_strip_header(&mutated).is_err(),
                "mutation at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_truncated_entry_is_rejected() {
        let entry = make_entry();
        let bytes = write_cache_entry(&entry).unwrap();
        assert!(try_parse_cache_entry(&bytes[..bytes.len() - 1]).is_err());
        assert!(try_parse_cache_entry(&bytes[..4]).is_err());
        assert!(verify_and_strip_header(b"short").is_err());
    }

    #[test]
    fn test_cache_key_shape_and_sensitivity() {
        let env = EnvironmentDesc::new("0123abcd");
        let key = get_cxx_cache_entry_key(&env, "-O2 -g", "srcdigest");
        assert!(key.starts_with("yadcc-cxx2-entry-"));
        assert_ne!(key, get_cxx_cache_entry_key(&env, "-O3 -g", "srcdigest"));
        assert_ne!(key, get_cxx_cache_entry_key(&env, "-O2 -g", "othersrc"));
        assert_ne!(
            key,
            get_cxx_cache_entry_key(&EnvironmentDesc::new("ffff"), "-O2 -g", "srcdigest")
        );
    }

    #[test]
    fn test_task_digest_differs_from_cache_key() {
        let env = EnvironmentDesc::new("0123abcd");
        let key = get_cxx_cache_entry_key(&env, "-O2", "src");
        let digest = get_cxx_task_digest(&env, "-O2", "src");
        assert!(!key.ends_with(&digest));
    }
}
